// Depot Downloader Library
// 可续传的 depot 下载编排核心库

// 目录数据模型与目录服务
pub mod catalog;

// 配置管理模块
pub mod config;

// 下载编排模块
pub mod downloader;

// 续传状态持久化
pub mod persistence;

// 日志系统
pub mod logging;

// 公共模块（网络策略、同步门、节流、重试）
pub mod common;

// 导出常用类型
pub use catalog::{AppId, CatalogService, DepotId, InMemoryCatalog, InstalledAppRecord};
pub use config::AppConfig;
pub use downloader::{
    DownloadEvent, DownloadJob, DownloadOrchestrator, DownloadPhase, TransferEngine,
    TransferEngineFactory,
};
pub use persistence::{InstallStateStore, MemoryInstallStateStore, SqliteInstallStateStore};
pub use common::{ConnectivityEvent, SyncError};
