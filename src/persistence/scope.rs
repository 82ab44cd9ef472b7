//! 续传范围
//!
//! 记录用户为本次安装选择的 DLC，数据库中的 pending 记录丢失时
//! 用于恢复续传范围。文件：`.DownloadInfo/resume_scope.json`

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::files::{progress_dir, remove_file_if_exists, write_atomic, SCOPE_FILE_NAME};
use crate::catalog::AppId;

/// 续传范围
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeScope {
    pub app_id: AppId,
    #[serde(default)]
    pub dlc_app_ids: Vec<AppId>,
}

impl ResumeScope {
    /// 创建续传范围（DLC 列表排序去重）
    pub fn new(app_id: AppId, dlc_app_ids: &[AppId]) -> Self {
        Self {
            app_id,
            dlc_app_ids: dlc_app_ids
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }
}

pub fn scope_path(app_dir: &Path) -> PathBuf {
    progress_dir(app_dir).join(SCOPE_FILE_NAME)
}

/// 持久化续传范围
pub fn persist_resume_scope(app_dir: &Path, app_id: AppId, dlc_app_ids: &[AppId]) -> io::Result<()> {
    let scope = ResumeScope::new(app_id, dlc_app_ids);
    let bytes = serde_json::to_vec_pretty(&scope)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&progress_dir(app_dir), SCOPE_FILE_NAME, &bytes)?;
    debug!("已保存续传范围: app_id={}, dlcs={:?}", app_id, scope.dlc_app_ids);
    Ok(())
}

/// 加载续传范围
///
/// # Returns
/// - `Some(ids)` - 文件属于该应用（空文件视为空范围）
/// - `None` - 文件不存在、属于其他应用或无法解析
pub fn load_resume_scope(app_dir: &Path, app_id: AppId) -> Option<Vec<AppId>> {
    let path = scope_path(app_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("读取续传范围失败: {:?}, 错误: {}", path, e);
            return None;
        }
    };

    if content.trim().is_empty() {
        return Some(Vec::new());
    }

    let scope: ResumeScope = match serde_json::from_str(&content) {
        Ok(scope) => scope,
        Err(e) => {
            warn!("续传范围文件无法解析: {:?}, 错误: {}", path, e);
            return None;
        }
    };

    if scope.app_id != app_id {
        warn!(
            "续传范围属于其他应用，忽略: 期望={}, 实际={}",
            app_id, scope.app_id
        );
        return None;
    }

    Some(ResumeScope::new(app_id, &scope.dlc_app_ids).dlc_app_ids)
}

pub fn delete_resume_scope(app_dir: &Path) -> bool {
    remove_file_if_exists(&scope_path(app_dir))
}
