//! 安装状态存储接口
//!
//! 已安装记录与待完成下载记录的键值存储。编排器只通过该 trait 访问，
//! 默认提供 SQLite 实现（[`super::SqliteInstallStateStore`]）与内存实现。

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::catalog::{AppId, InstalledAppRecord, PendingDownload};

/// 安装状态存储错误
#[derive(Debug, Error)]
pub enum InstallStateError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("获取数据库锁失败: {0}")]
    Lock(String),
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type InstallStateResult<T> = Result<T, InstallStateError>;

/// 安装状态存储
pub trait InstallStateStore: Send + Sync {
    fn installed_record(&self, app_id: AppId) -> InstallStateResult<Option<InstalledAppRecord>>;

    fn upsert_installed_record(&self, record: &InstalledAppRecord) -> InstallStateResult<()>;

    fn delete_installed_record(&self, app_id: AppId) -> InstallStateResult<()>;

    fn pending_download(&self, app_id: AppId) -> InstallStateResult<Option<PendingDownload>>;

    fn upsert_pending_download(&self, app_id: AppId, dlc_app_ids: &[AppId]) -> InstallStateResult<()>;

    fn delete_pending_download(&self, app_id: AppId) -> InstallStateResult<()>;
}

/// 内存安装状态存储
#[derive(Debug, Default)]
pub struct MemoryInstallStateStore {
    installed: Mutex<HashMap<AppId, InstalledAppRecord>>,
    pending: Mutex<HashMap<AppId, PendingDownload>>,
}

impl MemoryInstallStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstallStateStore for MemoryInstallStateStore {
    fn installed_record(&self, app_id: AppId) -> InstallStateResult<Option<InstalledAppRecord>> {
        Ok(self.installed.lock().get(&app_id).cloned())
    }

    fn upsert_installed_record(&self, record: &InstalledAppRecord) -> InstallStateResult<()> {
        self.installed.lock().insert(record.app_id, record.clone());
        Ok(())
    }

    fn delete_installed_record(&self, app_id: AppId) -> InstallStateResult<()> {
        self.installed.lock().remove(&app_id);
        Ok(())
    }

    fn pending_download(&self, app_id: AppId) -> InstallStateResult<Option<PendingDownload>> {
        Ok(self.pending.lock().get(&app_id).cloned())
    }

    fn upsert_pending_download(&self, app_id: AppId, dlc_app_ids: &[AppId]) -> InstallStateResult<()> {
        self.pending.lock().insert(
            app_id,
            PendingDownload {
                app_id,
                dlc_app_ids: dlc_app_ids.to_vec(),
            },
        );
        Ok(())
    }

    fn delete_pending_download(&self, app_id: AppId) -> InstallStateResult<()> {
        self.pending.lock().remove(&app_id);
        Ok(())
    }
}
