//! 下载事件定义
//!
//! 编排器通过 broadcast 通道推送事件，调用方自行订阅

use serde::{Deserialize, Serialize};

use crate::catalog::AppId;

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 进度更新
    Low = 0,
    /// 状态变更
    Medium = 1,
    /// 完成、失败、删除
    High = 2,
}

/// 下载事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务启动
    Started {
        app_id: AppId,
        job_id: String,
        mode: String,
        depot_ids: Vec<u32>,
        dlc_app_ids: Vec<AppId>,
        total_bytes: u64,
        resumed_bytes: u64,
    },
    /// 阶段变更
    StatusChanged {
        app_id: AppId,
        old_phase: String,
        new_phase: String,
    },
    /// 进度更新
    Progress {
        app_id: AppId,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed: u64,
        progress: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_secs: Option<u64>,
    },
    /// 下载完成
    Completed { app_id: AppId, completed_at: i64 },
    /// 下载失败
    Failed { app_id: AppId, error: String },
    /// 已暂停
    Paused { app_id: AppId },
    /// 因网络策略暂停
    PausedDueToConnectivity { app_id: AppId },
    /// 已删除安装内容
    Deleted { app_id: AppId },
    /// 面向用户的提示
    Notice { message: String },
}

impl DownloadEvent {
    /// 事件关联的应用（提示类事件没有）
    pub fn app_id(&self) -> Option<AppId> {
        match self {
            DownloadEvent::Started { app_id, .. }
            | DownloadEvent::StatusChanged { app_id, .. }
            | DownloadEvent::Progress { app_id, .. }
            | DownloadEvent::Completed { app_id, .. }
            | DownloadEvent::Failed { app_id, .. }
            | DownloadEvent::Paused { app_id }
            | DownloadEvent::PausedDueToConnectivity { app_id }
            | DownloadEvent::Deleted { app_id } => Some(*app_id),
            DownloadEvent::Notice { .. } => None,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            DownloadEvent::Progress { .. } => EventPriority::Low,
            DownloadEvent::Started { .. }
            | DownloadEvent::StatusChanged { .. }
            | DownloadEvent::Paused { .. }
            | DownloadEvent::PausedDueToConnectivity { .. }
            | DownloadEvent::Notice { .. } => EventPriority::Medium,
            DownloadEvent::Completed { .. }
            | DownloadEvent::Failed { .. }
            | DownloadEvent::Deleted { .. } => EventPriority::High,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            DownloadEvent::Started { .. } => "started",
            DownloadEvent::StatusChanged { .. } => "status_changed",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::Completed { .. } => "completed",
            DownloadEvent::Failed { .. } => "failed",
            DownloadEvent::Paused { .. } => "paused",
            DownloadEvent::PausedDueToConnectivity { .. } => "paused_due_to_connectivity",
            DownloadEvent::Deleted { .. } => "deleted",
            DownloadEvent::Notice { .. } => "notice",
        }
    }
}
