//! 续传快照
//!
//! 记录某个安装目标已下载字节数与已完成 depot 集合，是续传的唯一依据。
//!
//! ## 文件格式
//!
//! `.DownloadInfo/depot_bytes.json`：
//! ```json
//! { "bytesDownloaded": 734003200, "completedDepotIds": [5, 7] }
//! ```
//!
//! ## 设计原则
//!
//! - 写入走临时文件 + 原子重命名
//! - 文件损坏时删除并视为不存在
//! - 加载后必须经过 [`sanitize_snapshot`] 校验才能用于续传

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::files::{
    progress_dir, remove_file_if_exists, write_atomic, FAILED_SNAPSHOT_FILE_NAME,
    SNAPSHOT_FILE_NAME,
};
use crate::catalog::{AppId, DepotId};

/// 续传快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSnapshot {
    pub bytes_downloaded: u64,
    pub completed_depot_ids: BTreeSet<DepotId>,
}

impl ResumeSnapshot {
    pub fn new(bytes_downloaded: u64, completed: impl IntoIterator<Item = DepotId>) -> Self {
        Self {
            bytes_downloaded,
            completed_depot_ids: completed.into_iter().collect(),
        }
    }

    /// 没有任何进度
    pub fn is_empty(&self) -> bool {
        self.bytes_downloaded == 0 && self.completed_depot_ids.is_empty()
    }

    /// 已完成集合是否覆盖给定 depot
    pub fn covers<'a>(&self, depot_ids: impl IntoIterator<Item = &'a DepotId>) -> bool {
        depot_ids
            .into_iter()
            .all(|id| self.completed_depot_ids.contains(id))
    }
}

/// 磁盘上的原始格式（允许负数与越界 ID，加载时规整）
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    #[serde(default)]
    bytes_downloaded: i64,
    #[serde(default)]
    completed_depot_ids: Vec<i64>,
}

impl From<RawSnapshot> for ResumeSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        Self {
            bytes_downloaded: raw.bytes_downloaded.max(0) as u64,
            completed_depot_ids: raw
                .completed_depot_ids
                .into_iter()
                .filter_map(|id| DepotId::try_from(id).ok())
                .collect(),
        }
    }
}

pub fn snapshot_path(app_dir: &Path) -> PathBuf {
    progress_dir(app_dir).join(SNAPSHOT_FILE_NAME)
}

/// 加载续传快照
///
/// # Returns
/// - `Some(snapshot)` - 文件存在且可解析
/// - `None` - 文件不存在、为空或已损坏（损坏文件会被删除）
pub fn load_snapshot(app_dir: &Path) -> Option<ResumeSnapshot> {
    let path = snapshot_path(app_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("读取续传快照失败: {:?}, 错误: {}", path, e);
            return None;
        }
    };

    if content.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<RawSnapshot>(&content) {
        Ok(raw) => Some(raw.into()),
        Err(e) => {
            warn!("续传快照已损坏，删除: {:?}, 错误: {}", path, e);
            remove_file_if_exists(&path);
            None
        }
    }
}

/// 保存续传快照
pub fn save_snapshot(app_dir: &Path, snapshot: &ResumeSnapshot) -> io::Result<()> {
    write_snapshot_file(app_dir, SNAPSHOT_FILE_NAME, snapshot)?;
    debug!(
        "已保存续传快照: {:?} (bytes={}, depots={:?})",
        app_dir, snapshot.bytes_downloaded, snapshot.completed_depot_ids
    );
    Ok(())
}

/// 保存失败现场快照
///
/// 写入独立文件，不影响下一次的续传判定
pub fn save_failed_snapshot(app_dir: &Path, snapshot: &ResumeSnapshot) -> io::Result<()> {
    write_snapshot_file(app_dir, FAILED_SNAPSHOT_FILE_NAME, snapshot)
}

fn write_snapshot_file(app_dir: &Path, file_name: &str, snapshot: &ResumeSnapshot) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&progress_dir(app_dir), file_name, &bytes)
}

/// 删除续传快照
pub fn delete_snapshot(app_dir: &Path) -> bool {
    remove_file_if_exists(&snapshot_path(app_dir))
}

/// 是否存在有效的续传进度（非零字节或已完成 depot）
pub fn has_resume_metadata(app_dir: &Path) -> bool {
    load_snapshot(app_dir).map_or(false, |s| !s.is_empty())
}

/// 校验并规整快照
///
/// 1. 丢弃当前目录中已不存在的 depot
/// 2. 已完成 depot 的大小之和（下限）超过已下载字节时，清空已完成集合，保留字节数
///
/// # Arguments
/// * `app_id` - 仅用于日志
/// * `snapshot` - 原始快照
/// * `depot_sizes` - 当前选择中每个 depot 的大小（最小为 1）
pub fn sanitize_snapshot(
    app_id: AppId,
    snapshot: ResumeSnapshot,
    depot_sizes: &HashMap<DepotId, u64>,
) -> ResumeSnapshot {
    if snapshot.completed_depot_ids.is_empty() {
        return snapshot;
    }

    let (known, unknown): (BTreeSet<DepotId>, BTreeSet<DepotId>) = snapshot
        .completed_depot_ids
        .iter()
        .partition(|id| depot_sizes.contains_key(*id));

    if !unknown.is_empty() {
        warn!(
            "续传快照包含未知 depot，已丢弃: app_id={}, depots={:?}",
            app_id, unknown
        );
    }

    let floor: u64 = known
        .iter()
        .map(|id| depot_sizes.get(id).copied().unwrap_or(0))
        .sum();

    if floor > snapshot.bytes_downloaded {
        warn!(
            "续传快照不一致，清空已完成 depot: app_id={}, bytes={}, floor={}",
            app_id, snapshot.bytes_downloaded, floor
        );
        return ResumeSnapshot {
            bytes_downloaded: snapshot.bytes_downloaded,
            completed_depot_ids: BTreeSet::new(),
        };
    }

    ResumeSnapshot {
        bytes_downloaded: snapshot.bytes_downloaded,
        completed_depot_ids: known,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sizes(pairs: &[(DepotId, u64)]) -> HashMap<DepotId, u64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let temp = TempDir::new().unwrap();
        let snapshot = ResumeSnapshot::new(1024, [5, 7]);

        save_snapshot(temp.path(), &snapshot).unwrap();

        assert_eq!(load_snapshot(temp.path()), Some(snapshot));
        assert!(has_resume_metadata(temp.path()));
    }

    #[test]
    fn test_snapshot_wire_format() {
        let temp = TempDir::new().unwrap();
        save_snapshot(temp.path(), &ResumeSnapshot::new(10, [3])).unwrap();

        let raw = fs::read_to_string(snapshot_path(temp.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["bytesDownloaded"], 10);
        assert_eq!(value["completedDepotIds"], serde_json::json!([3]));
    }

    #[test]
    fn test_load_corrupt_snapshot_deletes_file() {
        let temp = TempDir::new().unwrap();
        let path = snapshot_path(temp.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        assert_eq!(load_snapshot(temp.path()), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_load_negative_bytes_clamped() {
        let temp = TempDir::new().unwrap();
        let path = snapshot_path(temp.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"bytesDownloaded": -50, "completedDepotIds": [1, -2]}"#).unwrap();

        let snapshot = load_snapshot(temp.path()).unwrap();
        assert_eq!(snapshot.bytes_downloaded, 0);
        assert_eq!(snapshot.completed_depot_ids, BTreeSet::from([1]));
    }

    #[test]
    fn test_empty_snapshot_is_not_resume_metadata() {
        let temp = TempDir::new().unwrap();
        save_snapshot(temp.path(), &ResumeSnapshot::default()).unwrap();
        assert!(!has_resume_metadata(temp.path()));
    }

    #[test]
    fn test_failed_snapshot_does_not_count_as_resume() {
        let temp = TempDir::new().unwrap();
        save_failed_snapshot(temp.path(), &ResumeSnapshot::new(99, [1])).unwrap();
        assert_eq!(load_snapshot(temp.path()), None);
    }

    #[test]
    fn test_sanitize_drops_unknown_depots() {
        let snapshot = ResumeSnapshot::new(1000, [1, 2, 99]);
        let result = sanitize_snapshot(100, snapshot, &sizes(&[(1, 300), (2, 400)]));
        assert_eq!(result, ResumeSnapshot::new(1000, [1, 2]));
    }

    #[test]
    fn test_sanitize_floor_violation_clears_depots_keeps_bytes() {
        let snapshot = ResumeSnapshot::new(500, [1, 2]);
        let result = sanitize_snapshot(100, snapshot, &sizes(&[(1, 300), (2, 400)]));
        assert_eq!(result.bytes_downloaded, 500);
        assert!(result.completed_depot_ids.is_empty());
    }

    proptest! {
        #[test]
        fn prop_sanitized_snapshot_respects_floor(
            bytes in 0u64..10_000,
            completed in proptest::collection::btree_set(0u32..20, 0..10),
            catalog in proptest::collection::hash_map(0u32..20, 1u64..3_000, 0..15),
        ) {
            let snapshot = ResumeSnapshot { bytes_downloaded: bytes, completed_depot_ids: completed };
            let result = sanitize_snapshot(1, snapshot, &catalog);

            let floor: u64 = result
                .completed_depot_ids
                .iter()
                .map(|id| catalog[id])
                .sum();
            prop_assert!(result.bytes_downloaded >= floor);
            prop_assert_eq!(result.bytes_downloaded, bytes);
            prop_assert!(result.completed_depot_ids.iter().all(|id| catalog.contains_key(id)));
        }
    }
}
