//! Depot 选择
//!
//! 给定目录快照、所有权与首选语言，计算需要下载的 depot 集合。
//! 纯函数：相同输入总是得到相同结果。
//!
//! ## 过滤顺序（第一条不满足即排除）
//!
//! 1. 有内容：分支有 Manifest，或为共享安装，或有加密 Manifest 占位
//! 2. 操作系统：Windows 标签通过；未标记的通过，除非只标了 Linux/macOS
//! 3. 架构：64 位与未知总是通过；32 位仅在应用没有 64 位 depot 时通过
//! 4. 所有权：DLC depot 在提供所有权信息时必须已拥有
//! 5. 语言：非空语言标签必须与首选语言完全一致

use std::collections::BTreeMap;

use tracing::debug;

use crate::catalog::{
    AppId, CatalogApp, CatalogSnapshot, DepotId, DepotRecord, OsArch, OsFamily, OwnershipContext,
};

/// 应用是否存在 64 位 depot
pub fn has_64bit_depot(app: &CatalogApp) -> bool {
    app.depots.values().any(|d| d.os_arch == OsArch::Arch64)
}

/// 判断单个 depot 是否可下载
///
/// # Arguments
/// * `depot` - 待判断的 depot
/// * `branch` - 分支
/// * `has_64bit` - 应用是否存在 64 位 depot
/// * `ownership` - 所有权上下文，`None` 表示不做所有权检查
/// * `language` - 首选语言
pub fn is_downloadable_depot(
    depot: &DepotRecord,
    branch: &str,
    has_64bit: bool,
    ownership: Option<&OwnershipContext>,
    language: &str,
) -> bool {
    // 只有加密 Manifest 的 depot 无法获取
    if depot.is_encrypted_only() {
        return false;
    }

    // 1. 有内容
    if !depot.manifests.contains_key(branch) && !depot.shared_install {
        return false;
    }

    // 2. 操作系统
    let windows = depot.os_list.contains(&OsFamily::Windows);
    let foreign_only =
        depot.os_list.contains(&OsFamily::Linux) || depot.os_list.contains(&OsFamily::Macos);
    if !windows && foreign_only {
        return false;
    }

    // 3. 架构
    if depot.os_arch == OsArch::Arch32 && has_64bit {
        return false;
    }

    // 4. 所有权
    if let (Some(dlc_app_id), Some(ctx)) = (depot.dlc_app_id, ownership) {
        if !ctx.allows(dlc_app_id) {
            return false;
        }
    }

    // 5. 语言
    depot.language.is_empty() || depot.language == language
}

/// 基础应用直属 depot 中可下载的部分（含嵌套 DLC depot）
pub fn main_app_depots(
    app: &CatalogApp,
    branch: &str,
    ownership: &OwnershipContext,
    language: &str,
) -> BTreeMap<DepotId, DepotRecord> {
    let has_64bit = has_64bit_depot(app);
    app.depots
        .iter()
        .filter(|(_, depot)| is_downloadable_depot(depot, branch, has_64bit, Some(ownership), language))
        .map(|(id, depot)| (*id, depot.clone()))
        .collect()
}

/// 计算可下载 depot 全集
///
/// 基础应用直属 depot 经过完整过滤；间接 DLC 应用的 depot 不做所有权检查，
/// 并改写为携带该 DLC 自身 ID 的记录后合并（同 ID 时覆盖基础应用的记录）。
pub fn select_downloadable_depots(
    catalog: &CatalogSnapshot,
    ownership: &OwnershipContext,
    language: &str,
) -> BTreeMap<DepotId, DepotRecord> {
    let branch = catalog.branch.as_str();
    let mut selected = main_app_depots(&catalog.app, branch, ownership, language);
    let has_64bit = has_64bit_depot(&catalog.app);

    for dlc_app in &catalog.indirect_dlc_apps {
        for (depot_id, depot) in &dlc_app.depots {
            if !is_downloadable_depot(depot, branch, has_64bit, None, language) {
                continue;
            }
            let mut merged = depot.clone();
            merged.dlc_app_id = Some(dlc_app.app_id);
            // 与基础应用同 ID 的 depot 以 DLC 记录为准
            if let Some(previous) = selected.insert(*depot_id, merged) {
                debug!(
                    "间接 DLC 覆盖基础应用 depot: depot={}, dlc={}, 原归属={:?}",
                    depot_id, dlc_app.app_id, previous.dlc_app_id
                );
            }
        }
    }

    debug!(
        "depot 选择完成: app_id={}, depots={:?}",
        catalog.app.app_id,
        selected.keys().collect::<Vec<_>>()
    );

    selected
}

/// 找出基础应用 depot 数据隐含、但没有正确标记的 DLC
///
/// 只针对一种目录异常：某个 DLC 在基础应用中只有一个 depot，
/// 该 depot 标记为 OS=none 且没有任何 Manifest，同时该 DLC 在隐藏 DLC 列表中。
pub fn main_app_dlc_ids_without_depot_tags(app: &CatalogApp, hidden_dlc_app_ids: &[AppId]) -> Vec<AppId> {
    if hidden_dlc_app_ids.is_empty() {
        return Vec::new();
    }

    let mut by_dlc: BTreeMap<AppId, Vec<&DepotRecord>> = BTreeMap::new();
    for depot in app.depots.values() {
        if let Some(dlc_app_id) = depot.dlc_app_id {
            by_dlc.entry(dlc_app_id).or_default().push(depot);
        }
    }

    by_dlc
        .into_iter()
        .filter_map(|(dlc_app_id, depots)| match depots.as_slice() {
            [only]
                if only.os_list.contains(&OsFamily::None)
                    && !only.has_any_manifest()
                    && hidden_dlc_app_ids.contains(&dlc_app_id) =>
            {
                Some(dlc_app_id)
            }
            _ => None,
        })
        .collect()
}
