//! 下载模块
//!
//! 从请求分类、depot 选择、工作集规划到任务执行与续传落盘

pub mod classify;
pub mod engine;
pub mod events;
pub mod listener;
pub mod manager;
pub mod plan;
pub mod progress;
pub mod registry;
pub mod selector;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify_request, DiskEvidence, DownloadRequest, RequestMode};
pub use engine::{
    TransferEngine, TransferEngineFactory, TransferError, TransferItem, TransferListener,
    TransferOptions, TransferPhase,
};
pub use events::{DownloadEvent, EventPriority};
pub use manager::DownloadOrchestrator;
pub use plan::{build_plan, DownloadPlan, PlanOutcome};
pub use progress::ProgressTracker;
pub use registry::DownloadJobRegistry;
pub use selector::select_downloadable_depots;
pub use task::{DownloadJob, DownloadPhase};
