//! 请求分类
//!
//! 在选择 depot 之前，根据磁盘证据把一次下载请求归为
//! 全新安装 / 续传 / 更新 / 校验 之一，并解析续传时应包含的 DLC 范围。

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::{AppId, PendingDownload};
use crate::persistence::{has_loose_content, has_marker, load_snapshot};

/// 请求模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// 全新安装
    Fresh,
    /// 续传
    Resume,
    /// 更新（包含已下载 depot 与已安装 DLC）
    Update,
    /// 校验（与更新相同的 depot 集合，不信任已完成状态）
    Verify,
}

impl RequestMode {
    /// 是否读取并应用续传快照
    pub fn allows_persisted_progress(self) -> bool {
        matches!(self, RequestMode::Resume)
    }

    /// 是否强制包含已安装 depot
    pub fn includes_installed_depots(self) -> bool {
        matches!(self, RequestMode::Update | RequestMode::Verify)
    }

    pub fn is_verify(self) -> bool {
        matches!(self, RequestMode::Verify)
    }
}

/// 调用方的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadRequest {
    /// 安装或继续安装（由磁盘证据决定）
    Install { dlc_app_ids: Option<Vec<AppId>> },
    /// 显式更新
    Update,
    /// 显式校验
    Verify,
}

/// 分类所需的磁盘证据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskEvidence {
    /// 存在安装完成标记
    pub has_complete_marker: bool,
    /// 续传快照含非零字节或已完成 depot
    pub has_resume_metadata: bool,
    /// 安装目录中存在进度子目录以外的文件
    pub has_loose_files: bool,
    /// 数据库中存在 pending 记录
    pub has_pending_row: bool,
}

impl DiskEvidence {
    /// 采集磁盘证据
    pub fn inspect(app_dir: &Path, has_pending_row: bool) -> Self {
        Self {
            has_complete_marker: has_marker(app_dir),
            has_resume_metadata: load_snapshot(app_dir).map_or(false, |s| !s.is_empty()),
            has_loose_files: has_loose_content(app_dir),
            has_pending_row,
        }
    }

    /// 是否存在部分下载的证据
    ///
    /// 已安装目录中的文件不算证据，只看续传快照与 pending 记录
    pub fn has_partial_download(&self) -> bool {
        if self.has_resume_metadata {
            return true;
        }
        if self.has_complete_marker {
            self.has_pending_row
        } else {
            self.has_loose_files
        }
    }
}

/// 对安装请求分类
pub fn classify_request(request: &DownloadRequest, evidence: &DiskEvidence) -> RequestMode {
    match request {
        DownloadRequest::Update => RequestMode::Update,
        DownloadRequest::Verify => RequestMode::Verify,
        DownloadRequest::Install { .. } => {
            if evidence.has_partial_download() {
                RequestMode::Resume
            } else {
                RequestMode::Fresh
            }
        }
    }
}

/// 续传范围来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSource {
    Explicit,
    PendingRow,
    PersistedScope,
    InferredFromSnapshot,
    InstalledDlcs,
}

/// 续传范围的各个候选来源
#[derive(Debug, Clone, Default)]
pub struct ScopeCandidates {
    pub explicit: Option<Vec<AppId>>,
    pub pending: Option<PendingDownload>,
    pub persisted: Option<Vec<AppId>>,
    /// 快照中已完成 depot 所属的 DLC
    pub inferred: Vec<AppId>,
    pub installed: Vec<AppId>,
}

/// 按优先级解析续传范围
///
/// 显式参数 → pending 记录 → 续传范围文件 → 快照推断 → 已安装 DLC。
/// 只恢复用户选择过的范围，不会扩大。
pub fn resolve_resume_scope(candidates: ScopeCandidates) -> (Vec<AppId>, ScopeSource) {
    let normalize = |ids: Vec<AppId>| -> Vec<AppId> {
        ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
    };

    if let Some(ids) = candidates.explicit {
        return (normalize(ids), ScopeSource::Explicit);
    }
    if let Some(pending) = candidates.pending {
        return (normalize(pending.dlc_app_ids), ScopeSource::PendingRow);
    }
    if let Some(ids) = candidates.persisted {
        return (normalize(ids), ScopeSource::PersistedScope);
    }
    if !candidates.inferred.is_empty() {
        return (normalize(candidates.inferred), ScopeSource::InferredFromSnapshot);
    }
    (normalize(candidates.installed), ScopeSource::InstalledDlcs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{add_marker, save_snapshot, ResumeSnapshot};
    use tempfile::TempDir;

    fn install() -> DownloadRequest {
        DownloadRequest::Install { dlc_app_ids: None }
    }

    #[test]
    fn test_classify_fresh() {
        let evidence = DiskEvidence::default();
        assert_eq!(classify_request(&install(), &evidence), RequestMode::Fresh);
    }

    #[test]
    fn test_classify_loose_files_without_marker_is_resume() {
        let evidence = DiskEvidence {
            has_loose_files: true,
            ..Default::default()
        };
        assert_eq!(classify_request(&install(), &evidence), RequestMode::Resume);
    }

    #[test]
    fn test_classify_installed_game_is_fresh() {
        let evidence = DiskEvidence {
            has_complete_marker: true,
            has_loose_files: true,
            ..Default::default()
        };
        assert_eq!(classify_request(&install(), &evidence), RequestMode::Fresh);
    }

    #[test]
    fn test_classify_marker_with_pending_row_is_resume() {
        let evidence = DiskEvidence {
            has_complete_marker: true,
            has_loose_files: true,
            has_pending_row: true,
            ..Default::default()
        };
        assert_eq!(classify_request(&install(), &evidence), RequestMode::Resume);
    }

    #[test]
    fn test_classify_snapshot_regardless_of_marker() {
        let evidence = DiskEvidence {
            has_complete_marker: true,
            has_resume_metadata: true,
            ..Default::default()
        };
        assert_eq!(classify_request(&install(), &evidence), RequestMode::Resume);
    }

    #[test]
    fn test_explicit_modes() {
        let evidence = DiskEvidence {
            has_resume_metadata: true,
            ..Default::default()
        };
        assert_eq!(classify_request(&DownloadRequest::Update, &evidence), RequestMode::Update);
        assert_eq!(classify_request(&DownloadRequest::Verify, &evidence), RequestMode::Verify);
        assert!(RequestMode::Verify.includes_installed_depots());
        assert!(!RequestMode::Verify.allows_persisted_progress());
    }

    #[test]
    fn test_inspect_disk() {
        let temp = TempDir::new().unwrap();
        add_marker(temp.path()).unwrap();
        save_snapshot(temp.path(), &ResumeSnapshot::new(10, [])).unwrap();

        let evidence = DiskEvidence::inspect(temp.path(), false);
        assert!(evidence.has_complete_marker);
        assert!(evidence.has_resume_metadata);
        assert!(!evidence.has_loose_files);
    }

    #[test]
    fn test_scope_priority_chain() {
        let full = ScopeCandidates {
            explicit: None,
            pending: Some(PendingDownload {
                app_id: 100,
                dlc_app_ids: vec![300, 200],
            }),
            persisted: Some(vec![400]),
            inferred: vec![500],
            installed: vec![600],
        };
        assert_eq!(
            resolve_resume_scope(full.clone()),
            (vec![200, 300], ScopeSource::PendingRow)
        );

        let no_pending = ScopeCandidates {
            pending: None,
            ..full.clone()
        };
        assert_eq!(
            resolve_resume_scope(no_pending.clone()),
            (vec![400], ScopeSource::PersistedScope)
        );

        let inferred_only = ScopeCandidates {
            persisted: None,
            ..no_pending
        };
        assert_eq!(
            resolve_resume_scope(inferred_only.clone()),
            (vec![500], ScopeSource::InferredFromSnapshot)
        );

        let installed_only = ScopeCandidates {
            inferred: vec![],
            ..inferred_only
        };
        assert_eq!(
            resolve_resume_scope(installed_only),
            (vec![600], ScopeSource::InstalledDlcs)
        );

        let explicit = ScopeCandidates {
            explicit: Some(vec![]),
            ..full
        };
        assert_eq!(resolve_resume_scope(explicit), (vec![], ScopeSource::Explicit));
    }
}
