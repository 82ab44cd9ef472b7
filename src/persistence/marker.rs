//! 安装完成标记
//!
//! 安装目录根部的空文件，存在即表示安装完整

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use super::files::remove_file_if_exists;

/// 标记文件名
pub const INSTALL_COMPLETE_MARKER: &str = ".download_complete";

pub fn has_marker(app_dir: &Path) -> bool {
    app_dir.join(INSTALL_COMPLETE_MARKER).is_file()
}

/// 写入完成标记（目录不存在时创建）
pub fn add_marker(app_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(app_dir)?;
    fs::write(app_dir.join(INSTALL_COMPLETE_MARKER), b"")?;
    debug!("已写入安装完成标记: {:?}", app_dir);
    Ok(())
}

/// 撤销完成标记，返回是否存在过
pub fn remove_marker(app_dir: &Path) -> bool {
    remove_file_if_exists(&app_dir.join(INSTALL_COMPLETE_MARKER))
}
