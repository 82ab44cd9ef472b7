// 配置管理模块

pub mod path_validator;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub use path_validator::PathValidator;

use crate::catalog::DEFAULT_BRANCH;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 网络策略
    #[serde(default)]
    pub network: NetworkConfig,
    /// 同步操作配置
    #[serde(default)]
    pub sync: SyncConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 安装根目录
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    /// 额外的安装根目录（同样受删除保护）
    #[serde(default)]
    pub extra_install_roots: Vec<PathBuf>,
    /// 下载分支
    #[serde(default = "default_branch")]
    pub branch: String,
    /// 首选语言
    #[serde(default = "default_language")]
    pub language: String,
    /// 下载速度档位（8/16/24/32）
    #[serde(default = "default_download_speed")]
    pub download_speed: u32,
    /// 续传快照节流落盘间隔（毫秒）
    #[serde(default = "default_snapshot_flush_interval_ms")]
    pub snapshot_flush_interval_ms: u64,
    /// 完成后等待 depot 回调的轮询次数
    #[serde(default = "default_completion_poll_attempts")]
    pub completion_poll_attempts: u32,
    /// 完成后轮询间隔（毫秒）
    #[serde(default = "default_completion_poll_interval_ms")]
    pub completion_poll_interval_ms: u64,
    /// 删除时等待任务退出的上限（毫秒）
    #[serde(default = "default_delete_wait_timeout_ms")]
    pub delete_wait_timeout_ms: u64,
    /// 阶段抖动压制窗口（毫秒）
    #[serde(default = "default_phase_flicker_window_ms")]
    pub phase_flicker_window_ms: u64,
    /// 进度事件最小间隔（毫秒）
    #[serde(default = "default_progress_event_interval_ms")]
    pub progress_event_interval_ms: u64,
}

fn default_install_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("/"))
        .join("games")
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_language() -> String {
    "english".to_string()
}

fn default_download_speed() -> u32 {
    8
}

fn default_snapshot_flush_interval_ms() -> u64 {
    5000
}

fn default_completion_poll_attempts() -> u32 {
    50
}

fn default_completion_poll_interval_ms() -> u64 {
    100
}

fn default_delete_wait_timeout_ms() -> u64 {
    3000
}

fn default_phase_flicker_window_ms() -> u64 {
    5000
}

fn default_progress_event_interval_ms() -> u64 {
    200
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            extra_install_roots: Vec::new(),
            branch: default_branch(),
            language: default_language(),
            download_speed: default_download_speed(),
            snapshot_flush_interval_ms: default_snapshot_flush_interval_ms(),
            completion_poll_attempts: default_completion_poll_attempts(),
            completion_poll_interval_ms: default_completion_poll_interval_ms(),
            delete_wait_timeout_ms: default_delete_wait_timeout_ms(),
            phase_flicker_window_ms: default_phase_flicker_window_ms(),
            progress_event_interval_ms: default_progress_event_interval_ms(),
        }
    }
}

impl DownloadConfig {
    /// 验证安装路径是否为绝对路径
    pub fn validate_install_dir(&self) -> Result<()> {
        if !self.install_dir.is_absolute() {
            anyhow::bail!(
                "安装目录必须是绝对路径，当前值: {:?}\n\
                 Windows 示例: D:\\Games\n\
                 Linux 示例: /home/user/games",
                self.install_dir
            );
        }
        if let Some(root) = self.extra_install_roots.iter().find(|r| !r.is_absolute()) {
            anyhow::bail!("额外安装根目录必须是绝对路径: {:?}", root);
        }
        Ok(())
    }

    /// 所有受保护的安装根目录
    pub fn install_roots(&self) -> Vec<PathBuf> {
        std::iter::once(self.install_dir.clone())
            .chain(self.extra_install_roots.iter().cloned())
            .collect()
    }

    /// 应用的安装目录
    ///
    /// 目录名不可用时退化为应用 ID
    pub fn app_dir(&self, app_id: u32, dir_name: Option<&str>) -> PathBuf {
        match dir_name {
            Some(name) if PathValidator::is_valid_dir_name(name) => {
                self.install_dir.join(name.trim())
            }
            _ => self.install_dir.join(app_id.to_string()),
        }
    }

    pub fn snapshot_flush_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_flush_interval_ms)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_interval_ms)
    }

    pub fn delete_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_wait_timeout_ms)
    }

    pub fn phase_flicker_window(&self) -> Duration {
        Duration::from_millis(self.phase_flicker_window_ms)
    }

    pub fn progress_event_interval(&self) -> Duration {
        Duration::from_millis(self.progress_event_interval_ms)
    }
}

/// 网络策略配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 仅在不计流量网络（Wi-Fi/有线）下下载
    #[serde(default)]
    pub wifi_only: bool,
}

/// 同步操作配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 最大尝试次数
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: u32,
    /// 线性退避基准（毫秒）
    #[serde(default = "default_sync_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_sync_max_attempts() -> u32 {
    3
}

fn default_sync_retry_base_delay_ms() -> u64 {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_sync_max_attempts(),
            retry_base_delay_ms: default_sync_retry_base_delay_ms(),
        }
    }
}

impl SyncConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate_install_dir()
            .context("配置文件中的安装路径验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        self.download
            .validate_install_dir()
            .context("保存配置失败：安装路径必须是绝对路径")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) =
                    PathValidator::ensure_directory_exists(&default_config.download.install_dir)
                {
                    tracing::error!("无法创建默认安装目录: {:#}", e);
                }

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
