//! 进度目录与原子写入
//!
//! 每个安装目标在其安装目录下有一个独立的进度子目录 `.DownloadInfo/`，
//! 与游戏内容分开存放：
//!
//! ```text
//! <install_dir>/
//!   .download_complete          安装完成标记
//!   .DownloadInfo/
//!     depot_bytes.json          续传快照
//!     resume_scope.json         续传范围
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::marker::INSTALL_COMPLETE_MARKER;

/// 进度子目录名
pub const PROGRESS_DIR_NAME: &str = ".DownloadInfo";

/// 续传快照文件名
pub const SNAPSHOT_FILE_NAME: &str = "depot_bytes.json";

/// 失败时保留的快照文件名（不参与续传判定）
pub const FAILED_SNAPSHOT_FILE_NAME: &str = "depot_bytes.failed.json";

/// 续传范围文件名
pub const SCOPE_FILE_NAME: &str = "resume_scope.json";

/// 获取进度子目录路径
pub fn progress_dir(app_dir: &Path) -> PathBuf {
    app_dir.join(PROGRESS_DIR_NAME)
}

/// 原子写入
///
/// 先写 `{file}.tmp` 并 fsync，再重命名到目标路径。
/// 重命名失败（例如跨卷）时退化为直接写入目标文件并删除临时文件。
pub fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let target = dir.join(file_name);
    let temp = dir.join(format!("{}.tmp", file_name));

    {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }

    if let Err(rename_err) = fs::rename(&temp, &target) {
        warn!(
            "原子重命名失败，改为直接写入: {:?}, 错误: {}",
            target, rename_err
        );
        let direct = fs::write(&target, bytes);
        remove_file_if_exists(&temp);
        direct?;
    }

    Ok(())
}

/// 删除文件（不存在视为成功）
///
/// 返回是否实际删除了文件；删除失败只记录日志
pub fn remove_file_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("删除文件失败: {:?}, 错误: {}", path, e);
            false
        }
    }
}

/// 目录为空时删除
pub fn remove_dir_if_empty(dir: &Path) {
    let is_empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return,
    };
    if is_empty {
        if let Err(e) = fs::remove_dir(dir) {
            debug!("删除空进度目录失败: {:?}, 错误: {}", dir, e);
        }
    }
}

/// 清理续传快照与续传范围，进度目录为空时一并删除
pub fn clear_progress_files(app_dir: &Path) {
    let dir = progress_dir(app_dir);
    remove_file_if_exists(&dir.join(SNAPSHOT_FILE_NAME));
    remove_file_if_exists(&dir.join(SCOPE_FILE_NAME));
    remove_dir_if_empty(&dir);
}

/// 安装目录中是否存在进度子目录之外的内容
///
/// 安装完成标记本身不算内容
pub fn has_loose_content(app_dir: &Path) -> bool {
    let entries = match fs::read_dir(app_dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    entries.flatten().any(|entry| {
        let name = entry.file_name();
        name != PROGRESS_DIR_NAME && name != INSTALL_COMPLETE_MARKER
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(PROGRESS_DIR_NAME);

        write_atomic(&dir, SNAPSHOT_FILE_NAME, b"{}").unwrap();
        write_atomic(&dir, SNAPSHOT_FILE_NAME, b"{\"a\":1}").unwrap();

        assert_eq!(
            fs::read_to_string(dir.join(SNAPSHOT_FILE_NAME)).unwrap(),
            "{\"a\":1}"
        );
        assert!(!dir.join("depot_bytes.json.tmp").exists());
    }

    #[test]
    fn test_clear_progress_files_removes_empty_dir() {
        let temp = TempDir::new().unwrap();
        let dir = progress_dir(temp.path());
        write_atomic(&dir, SNAPSHOT_FILE_NAME, b"{}").unwrap();
        write_atomic(&dir, SCOPE_FILE_NAME, b"{}").unwrap();

        clear_progress_files(temp.path());

        assert!(!dir.exists());
    }

    #[test]
    fn test_clear_progress_files_keeps_foreign_files() {
        let temp = TempDir::new().unwrap();
        let dir = progress_dir(temp.path());
        write_atomic(&dir, SNAPSHOT_FILE_NAME, b"{}").unwrap();
        write_atomic(&dir, FAILED_SNAPSHOT_FILE_NAME, b"{}").unwrap();

        clear_progress_files(temp.path());

        assert!(dir.exists());
        assert!(!dir.join(SNAPSHOT_FILE_NAME).exists());
    }

    #[test]
    fn test_has_loose_content() {
        let temp = TempDir::new().unwrap();
        assert!(!has_loose_content(temp.path()));

        write_atomic(&progress_dir(temp.path()), SNAPSHOT_FILE_NAME, b"{}").unwrap();
        fs::write(temp.path().join(INSTALL_COMPLETE_MARKER), b"").unwrap();
        assert!(!has_loose_content(temp.path()));

        fs::write(temp.path().join("game.pak"), b"data").unwrap();
        assert!(has_loose_content(temp.path()));
    }

    #[test]
    fn test_has_loose_content_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert!(!has_loose_content(&temp.path().join("missing")));
    }
}
