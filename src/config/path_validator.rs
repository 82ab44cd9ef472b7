// 安装路径校验模块

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// 安装路径校验器
pub struct PathValidator;

impl PathValidator {
    /// 规范化路径
    ///
    /// 路径存在时解析符号链接（Windows 上去掉 `\\?\` 前缀），
    /// 不存在时仅做词法规范化
    pub fn normalize(path: &Path) -> PathBuf {
        match dunce::canonicalize(path) {
            Ok(resolved) => resolved,
            Err(_) => Self::lexical_normalize(path),
        }
    }

    fn lexical_normalize(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other.as_os_str()),
            }
        }
        out
    }

    /// 检查目录名能否安全地拼接到安装根目录下
    ///
    /// 拒绝空名、`.`/`..` 与包含路径分隔符的名称
    pub fn is_valid_dir_name(name: &str) -> bool {
        let trimmed = name.trim();
        !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && !trimmed.contains(['/', '\\'])
    }

    /// 删除目标是否安全
    ///
    /// 目标必须严格位于某个安装根目录之内，不能是根目录本身
    ///
    /// # Arguments
    /// * `target` - 待删除目录
    /// * `roots` - 受保护的安装根目录
    pub fn is_safe_delete_target(target: &Path, roots: &[PathBuf]) -> bool {
        if !target.is_absolute() {
            return false;
        }
        let target = Self::normalize(target);
        if target.parent().is_none() {
            return false;
        }

        let mut inside_root = false;
        for root in roots {
            let root = Self::normalize(root);
            if target == root {
                return false;
            }
            if target.starts_with(&root) {
                inside_root = true;
            }
        }
        inside_root
    }

    /// 确保目录存在（不存在则创建）
    pub fn ensure_directory_exists(path: &Path) -> Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(path).with_context(|| format!("创建目录失败: {:?}", path))?;
        tracing::info!("已创建目录: {:?}", path);
        Ok(())
    }
}
