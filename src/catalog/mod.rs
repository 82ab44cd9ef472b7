//! 目录模块
//!
//! depot / manifest / 安装记录的数据模型，以及目录服务接口

pub mod service;
pub mod types;

pub use service::{CatalogService, InMemoryCatalog};
pub use types::{
    sorted_union, AppId, CatalogApp, CatalogSnapshot, DepotId, DepotRecord,
    InstalledAppRecord, ManifestInfo, OsArch, OsFamily, OwnershipContext, PendingDownload,
    DEFAULT_BRANCH,
};
