//! 下载任务注册表
//!
//! 每个安装目标同时最多一个任务。移除时比较指针，
//! 旧任务的收尾不会误删同一应用上新创建的任务。

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::task::DownloadJob;
use crate::catalog::AppId;

/// 任务注册表
#[derive(Debug, Default)]
pub struct DownloadJobRegistry {
    jobs: DashMap<AppId, Arc<DownloadJob>>,
}

impl DownloadJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_id: AppId) -> Option<Arc<DownloadJob>> {
        self.jobs.get(&app_id).map(|job| job.clone())
    }

    /// 获取仍在运行的任务
    pub fn get_active(&self, app_id: AppId) -> Option<Arc<DownloadJob>> {
        self.get(app_id).filter(|job| job.is_active())
    }

    /// 插入任务
    ///
    /// # Returns
    /// - `Ok(job)`: 插入成功
    /// - `Err(existing)`: 已有活动任务，返回已有任务
    pub fn try_insert(&self, job: Arc<DownloadJob>) -> Result<Arc<DownloadJob>, Arc<DownloadJob>> {
        match self.jobs.entry(job.app_id()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_active() {
                    Err(entry.get().clone())
                } else {
                    entry.insert(job.clone());
                    Ok(job)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
                Ok(job)
            }
        }
    }

    /// 移除任务（仅当注册的正是 `expected`）
    pub fn remove(&self, app_id: AppId, expected: &Arc<DownloadJob>) -> bool {
        self.jobs
            .remove_if(&app_id, |_, job| Arc::ptr_eq(job, expected))
            .is_some()
    }

    /// 所有活动任务
    pub fn active_jobs(&self) -> Vec<Arc<DownloadJob>> {
        self.jobs
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
