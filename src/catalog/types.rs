//! 目录数据类型
//!
//! Depot、Manifest、已安装记录等目录事实的内存表示。
//! 这些类型由目录服务提供，核心逻辑只读不写。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 应用 ID（基础游戏或 DLC）
pub type AppId = u32;

/// Depot ID
pub type DepotId = u32;

/// 默认发布分支
pub const DEFAULT_BRANCH: &str = "public";

/// 操作系统标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
    Macos,
    /// 目录中显式标记为 none（隐藏 DLC 数据包常见）
    None,
}

/// 架构类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsArch {
    Arch32,
    Arch64,
    Unknown,
}

impl Default for OsArch {
    fn default() -> Self {
        OsArch::Unknown
    }
}

/// 某分支下的 Manifest 描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub manifest_id: u64,
    pub size_bytes: u64,
}

/// Depot 记录
///
/// 一个可独立安装的内容单元。`dlc_app_id` 为 `None` 表示属于基础应用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotRecord {
    pub depot_id: DepotId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlc_app_id: Option<AppId>,
    /// 支持的操作系统（空 = 未标记）
    #[serde(default)]
    pub os_list: BTreeSet<OsFamily>,
    #[serde(default)]
    pub os_arch: OsArch,
    /// 语言标签（空 = 与语言无关）
    #[serde(default)]
    pub language: String,
    /// 分支 -> Manifest
    #[serde(default)]
    pub manifests: BTreeMap<String, ManifestInfo>,
    /// 分支 -> 加密 Manifest 占位
    #[serde(default)]
    pub encrypted_manifests: BTreeMap<String, ManifestInfo>,
    /// 共享安装：本身没有 Manifest，随其他 depot 一起安装
    #[serde(default)]
    pub shared_install: bool,
}

impl DepotRecord {
    /// 创建只包含 ID 的空 depot，其余字段由调用方填充
    pub fn new(depot_id: DepotId) -> Self {
        Self {
            depot_id,
            dlc_app_id: None,
            os_list: BTreeSet::new(),
            os_arch: OsArch::Unknown,
            language: String::new(),
            manifests: BTreeMap::new(),
            encrypted_manifests: BTreeMap::new(),
            shared_install: false,
        }
    }

    /// 设置指定分支的 Manifest
    pub fn with_manifest(mut self, branch: &str, manifest_id: u64, size_bytes: u64) -> Self {
        self.manifests.insert(
            branch.to_string(),
            ManifestInfo {
                manifest_id,
                size_bytes,
            },
        );
        self
    }

    pub fn with_dlc(mut self, dlc_app_id: AppId) -> Self {
        self.dlc_app_id = Some(dlc_app_id);
        self
    }

    pub fn with_os(mut self, os: OsFamily) -> Self {
        self.os_list.insert(os);
        self
    }

    pub fn with_arch(mut self, arch: OsArch) -> Self {
        self.os_arch = arch;
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    /// 是否存在任意分支的 Manifest
    pub fn has_any_manifest(&self) -> bool {
        !self.manifests.is_empty()
    }

    /// 只有加密 Manifest 占位、没有明文 Manifest
    pub fn is_encrypted_only(&self) -> bool {
        self.manifests.is_empty() && !self.encrypted_manifests.is_empty()
    }

    /// 按分支计算 depot 权重（字节数，最小为 1）
    ///
    /// 优先使用明文 Manifest，其次使用加密占位的大小
    pub fn size_for_branch(&self, branch: &str) -> u64 {
        self.manifests
            .get(branch)
            .or_else(|| self.encrypted_manifests.get(branch))
            .map(|m| m.size_bytes)
            .unwrap_or(1)
            .max(1)
    }
}

/// 目录中的一个应用及其直属 depot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogApp {
    pub app_id: AppId,
    pub depots: BTreeMap<DepotId, DepotRecord>,
}

impl CatalogApp {
    pub fn new(app_id: AppId, depots: impl IntoIterator<Item = DepotRecord>) -> Self {
        Self {
            app_id,
            depots: depots.into_iter().map(|d| (d.depot_id, d)).collect(),
        }
    }
}

/// 一次选择所需的目录快照
///
/// 由编排器从目录服务拉取后组装，选择逻辑只读取这份快照
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub app: CatalogApp,
    /// 间接 DLC 应用（不在基础应用 depot 列表中的 DLC）
    pub indirect_dlc_apps: Vec<CatalogApp>,
    /// 已知的隐藏 DLC 列表
    pub hidden_dlc_app_ids: Vec<AppId>,
    /// 选择使用的分支
    pub branch: String,
}

/// 所有权上下文
///
/// `owned_dlc_app_ids` 为 `None` 表示未提供所有权信息，不做所有权过滤
#[derive(Debug, Clone, Default)]
pub struct OwnershipContext {
    pub owned_dlc_app_ids: Option<BTreeSet<AppId>>,
}

impl OwnershipContext {
    pub fn unrestricted() -> Self {
        Self {
            owned_dlc_app_ids: None,
        }
    }

    pub fn owning(ids: impl IntoIterator<Item = AppId>) -> Self {
        Self {
            owned_dlc_app_ids: Some(ids.into_iter().collect()),
        }
    }

    /// DLC 是否被允许（未提供所有权信息时一律允许）
    pub fn allows(&self, dlc_app_id: AppId) -> bool {
        match &self.owned_dlc_app_ids {
            Some(owned) => owned.contains(&dlc_app_id),
            None => true,
        }
    }
}

/// 已安装应用记录
///
/// 磁盘上实际安装内容的持久账本，只在 depot 集合完成时写入
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAppRecord {
    pub app_id: AppId,
    pub is_downloaded: bool,
    pub downloaded_depot_ids: Vec<DepotId>,
    pub dlc_depot_ids: Vec<AppId>,
}

impl InstalledAppRecord {
    /// 合并新完成的 depot（去重、排序）
    pub fn merge(&mut self, depot_ids: &[DepotId], dlc_ids: &[AppId]) {
        self.is_downloaded = true;
        self.downloaded_depot_ids = sorted_union(&self.downloaded_depot_ids, depot_ids);
        self.dlc_depot_ids = sorted_union(&self.dlc_depot_ids, dlc_ids);
    }
}

/// 待完成下载记录（数据库中的 pending 行）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDownload {
    pub app_id: AppId,
    pub dlc_app_ids: Vec<AppId>,
}

/// 有序去重并集
pub fn sorted_union(a: &[u32], b: &[u32]) -> Vec<u32> {
    a.iter()
        .chain(b.iter())
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
