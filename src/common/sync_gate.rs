//! 同步操作单飞门
//!
//! 每个应用一个布尔门，通过 compare_exchange 获取，
//! 守卫 drop 时无条件释放（包括 panic 与提前返回）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::catalog::AppId;

/// 同步操作错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// 同一应用已有同步操作在进行
    #[error("应用 {0} 的同步操作正在进行")]
    InProgress(AppId),
    /// 可重试的瞬时错误
    #[error("瞬时错误: {0}")]
    Transient(String),
    /// 不可重试的错误
    #[error("同步失败: {0}")]
    Failed(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

/// 同步单飞门
#[derive(Debug, Default)]
pub struct SyncGate {
    gates: DashMap<AppId, Arc<AtomicBool>>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试获取应用的同步门
    ///
    /// # Returns
    /// - `Some(SyncGuard)`: 获取成功
    /// - `None`: 已被占用
    pub fn try_acquire(&self, app_id: AppId) -> Option<SyncGuard> {
        let flag = self
            .gates
            .entry(app_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncGuard { app_id, flag })
    }

    pub fn is_held(&self, app_id: AppId) -> bool {
        self.gates
            .get(&app_id)
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    /// 是否有任意同步操作在进行
    pub fn any_held(&self) -> bool {
        self.gates.iter().any(|entry| entry.value().load(Ordering::SeqCst))
    }
}

/// 同步门守卫（RAII）
#[derive(Debug)]
pub struct SyncGuard {
    app_id: AppId,
    flag: Arc<AtomicBool>,
}

impl SyncGuard {
    pub fn app_id(&self) -> AppId {
        self.app_id
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
