//! 持久化模块
//!
//! 续传所需的全部磁盘状态：
//! - 续传快照（depot_bytes.json）
//! - 续传范围（resume_scope.json）
//! - 安装完成标记
//! - 安装状态存储（已安装记录、待完成下载）
//!
//! ## 设计原则
//!
//! - 所有写入先落临时文件再原子重命名
//! - 清理类操作尽力而为，失败只记录日志

pub mod files;
pub mod install_db;
pub mod install_state;
pub mod marker;
pub mod scope;
pub mod snapshot;

pub use files::{
    clear_progress_files, has_loose_content, progress_dir, write_atomic, PROGRESS_DIR_NAME,
    SCOPE_FILE_NAME, SNAPSHOT_FILE_NAME,
};
pub use install_db::SqliteInstallStateStore;
pub use install_state::{
    InstallStateError, InstallStateResult, InstallStateStore, MemoryInstallStateStore,
};
pub use marker::{add_marker, has_marker, remove_marker, INSTALL_COMPLETE_MARKER};
pub use scope::{delete_resume_scope, load_resume_scope, persist_resume_scope, ResumeScope};
pub use snapshot::{
    delete_snapshot, has_resume_metadata, load_snapshot, sanitize_snapshot, save_failed_snapshot,
    save_snapshot, ResumeSnapshot,
};
