//! 下载计划
//!
//! 在 depot 选择结果之上做裁剪与字节核算，产出交给传输引擎的工作项。
//! 本模块不做任何 IO，磁盘与数据库副作用由编排器根据结果执行。
//!
//! ## 裁剪规则
//!
//! 1. 非更新/校验模式下，受信任的已安装记录中的 depot 从基础应用子集剔除
//! 2. 续传快照中已完成的 depot 从工作集剔除（基础应用与 DLC 子集）
//! 3. 工作集为空时：
//!    - 裁剪前也为空 → 无事可做
//!    - 快照覆盖裁剪前的全部 depot → 直接合成完成
//!    - 其他情况 → 视为过期续传，重置

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use super::classify::RequestMode;
use crate::catalog::{AppId, DepotId, DepotRecord, InstalledAppRecord};
use crate::persistence::{sanitize_snapshot, ResumeSnapshot};

/// 交给传输引擎的工作项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub app_id: AppId,
    pub depot_ids: Vec<DepotId>,
}

/// 完成时写入安装记录的归属
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerDepots {
    pub app_id: AppId,
    pub depot_ids: Vec<DepotId>,
    /// 写入记录的 DLC 列表（仅基础应用使用）
    pub dlc_ids: Vec<AppId>,
}

/// 规划输入
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    pub app_id: AppId,
    pub mode: RequestMode,
    pub branch: &'a str,
    /// depot 选择结果
    pub selection: &'a BTreeMap<DepotId, DepotRecord>,
    /// 本次包含的 DLC
    pub dlc_scope: &'a [AppId],
    /// 基础应用 depot 数据隐含的 DLC
    pub main_app_dlc_ids: &'a [AppId],
    /// 磁盘上的原始快照
    pub snapshot: Option<ResumeSnapshot>,
    /// 基础应用已安装记录
    pub installed: Option<InstalledAppRecord>,
    /// DLC 已安装记录
    pub installed_dlcs: HashMap<AppId, InstalledAppRecord>,
    pub has_complete_marker: bool,
}

/// 下载计划
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub app_id: AppId,
    pub mode: RequestMode,
    /// 本次捆绑的 DLC
    pub dlc_app_ids: Vec<AppId>,
    /// 工作集（快照裁剪后），depot ID 升序
    pub selected_depot_ids: Vec<DepotId>,
    /// 快照裁剪前的 depot 集合，完成判定以此为准
    pub pre_snapshot_depot_ids: Vec<DepotId>,
    /// 每个 depot 的权重（字节，最小 1）
    pub depot_sizes: HashMap<DepotId, u64>,
    pub work_items: Vec<WorkItem>,
    pub owners: Vec<OwnerDepots>,
    /// 校验后的快照（仅续传模式）
    pub snapshot: Option<ResumeSnapshot>,
    /// 裁剪前选择的总字节
    pub total_bytes: u64,
    /// 快照中已下载的字节（夹在 [0, total] 内）
    pub resumed_bytes: u64,
    /// 快照已完成 depot 的字节
    pub completed_depot_bytes: u64,
}

impl DownloadPlan {
    /// 快照字节中属于未完成 depot 的部分（传输引擎会再次上报，需要从基线扣除）
    pub fn partial_bytes_already_counted(&self) -> u64 {
        self.resumed_bytes.saturating_sub(self.completed_depot_bytes)
    }
}

/// 规划结果
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// 无事可做
    NothingToDo { clear_resume_state: bool },
    /// 快照已覆盖全部 depot，直接合成完成
    FinalizeFromSnapshot(DownloadPlan),
    /// 快照与选择不一致，清空续传状态
    StaleResume,
    /// 启动下载
    Download(DownloadPlan),
}

/// 规划结论与附带的副作用
#[derive(Debug, Clone)]
pub struct PlanDecision {
    pub outcome: PlanOutcome,
    /// 撤销安装完成标记
    pub remove_marker: bool,
    /// 删除不可信的已安装记录
    pub drop_installed_record: bool,
}

/// 生成下载计划
pub fn build_plan(input: PlanInput<'_>) -> PlanDecision {
    let allow_persisted = input.mode.allows_persisted_progress();
    let include_installed = input.mode.includes_installed_depots();
    let scope: BTreeSet<AppId> = input.dlc_scope.iter().copied().collect();

    // 基础应用 depot 与本次范围内的 DLC depot
    let original_main: BTreeMap<DepotId, &DepotRecord> = input
        .selection
        .iter()
        .filter(|(_, d)| d.dlc_app_id.is_none())
        .map(|(id, d)| (*id, d))
        .collect();
    let dlc_depots: BTreeMap<DepotId, &DepotRecord> = input
        .selection
        .iter()
        .filter(|(_, d)| {
            d.dlc_app_id.map_or(false, |dlc| scope.contains(&dlc)) && d.has_any_manifest()
        })
        .map(|(id, d)| (*id, d))
        .collect();

    let depot_sizes: HashMap<DepotId, u64> = original_main
        .iter()
        .chain(dlc_depots.iter())
        .map(|(id, d)| (*id, d.size_for_branch(input.branch)))
        .collect();

    let snapshot = if allow_persisted {
        input
            .snapshot
            .map(|s| sanitize_snapshot(input.app_id, s, &depot_sizes))
    } else {
        None
    };

    let snapshot_requires_resume = snapshot
        .as_ref()
        .map_or(false, |s| !s.covers(depot_sizes.keys()));
    let mut remove_marker = snapshot_requires_resume && input.has_complete_marker;
    let marker_trusted = input.has_complete_marker && !snapshot_requires_resume;

    // 已安装记录是否可信
    let trusted_installed = input
        .installed
        .as_ref()
        .filter(|r| r.is_downloaded && marker_trusted);
    let drop_installed_record = !include_installed
        && trusted_installed.is_none()
        && input.installed.as_ref().map_or(false, |r| {
            r.is_downloaded || !r.downloaded_depot_ids.is_empty() || !r.dlc_depot_ids.is_empty()
        });

    let mut main: BTreeMap<DepotId, &DepotRecord> = original_main.clone();
    let mut dlc_pending: BTreeMap<DepotId, &DepotRecord> = dlc_depots.clone();
    if !include_installed {
        if let Some(record) = trusted_installed {
            for id in &record.downloaded_depot_ids {
                main.remove(id);
            }
        }
        if marker_trusted {
            dlc_pending.retain(|id, d| {
                let installed = d
                    .dlc_app_id
                    .and_then(|dlc| input.installed_dlcs.get(&dlc))
                    .filter(|r| r.is_downloaded);
                !installed.map_or(false, |r| r.downloaded_depot_ids.contains(id))
            });
        }
    }

    let pre_snapshot: BTreeSet<DepotId> = main.keys().chain(dlc_pending.keys()).copied().collect();
    let covers_selection = snapshot
        .as_ref()
        .map_or(false, |s| s.covers(pre_snapshot.iter()));

    let completed: BTreeSet<DepotId> = snapshot
        .as_ref()
        .map(|s| s.completed_depot_ids.clone())
        .unwrap_or_default();
    let working_main: Vec<DepotId> = main.keys().filter(|id| !completed.contains(*id)).copied().collect();
    let working_dlc: BTreeMap<DepotId, &DepotRecord> = dlc_pending
        .iter()
        .filter(|(id, _)| !completed.contains(*id))
        .map(|(id, d)| (*id, *d))
        .collect();

    // 完成时的记录归属
    let mut owners = Vec::new();
    if !original_main.is_empty() {
        owners.push(OwnerDepots {
            app_id: input.app_id,
            depot_ids: original_main.keys().copied().collect(),
            dlc_ids: input.main_app_dlc_ids.to_vec(),
        });
    }
    let mut dlc_app_ids = Vec::new();
    for dlc in &scope {
        let ids: Vec<DepotId> = dlc_depots
            .iter()
            .filter(|(_, d)| d.dlc_app_id == Some(*dlc))
            .map(|(id, _)| *id)
            .collect();
        if !ids.is_empty() {
            dlc_app_ids.push(*dlc);
            owners.push(OwnerDepots {
                app_id: *dlc,
                depot_ids: ids,
                dlc_ids: Vec::new(),
            });
        }
    }

    // 工作项
    let mut work_items = Vec::new();
    if !working_main.is_empty() {
        work_items.push(WorkItem {
            app_id: input.app_id,
            depot_ids: working_main.clone(),
        });
    }
    for dlc in &dlc_app_ids {
        let ids: Vec<DepotId> = working_dlc
            .iter()
            .filter(|(_, d)| d.dlc_app_id == Some(*dlc))
            .map(|(id, _)| *id)
            .collect();
        if !ids.is_empty() {
            work_items.push(WorkItem {
                app_id: *dlc,
                depot_ids: ids,
            });
        }
    }

    let total_bytes = pre_snapshot
        .iter()
        .map(|id| depot_sizes.get(id).copied().unwrap_or(1))
        .sum::<u64>()
        .max(1);
    let resumed_bytes = snapshot
        .as_ref()
        .map_or(0, |s| s.bytes_downloaded.min(total_bytes));
    let completed_depot_bytes: u64 = completed
        .iter()
        .filter_map(|id| depot_sizes.get(id))
        .sum();

    let mut selected_depot_ids: Vec<DepotId> = working_main
        .iter()
        .copied()
        .chain(working_dlc.keys().copied())
        .collect();
    selected_depot_ids.sort_unstable();

    let plan = DownloadPlan {
        app_id: input.app_id,
        mode: input.mode,
        dlc_app_ids,
        selected_depot_ids,
        pre_snapshot_depot_ids: pre_snapshot.iter().copied().collect(),
        depot_sizes,
        work_items,
        owners,
        snapshot,
        total_bytes,
        resumed_bytes,
        completed_depot_bytes,
    };

    let outcome = if !plan.selected_depot_ids.is_empty() {
        if allow_persisted && input.has_complete_marker && !covers_selection {
            remove_marker = true;
        }
        PlanOutcome::Download(plan)
    } else if pre_snapshot.is_empty() {
        PlanOutcome::NothingToDo {
            clear_resume_state: allow_persisted,
        }
    } else if allow_persisted && covers_selection {
        PlanOutcome::FinalizeFromSnapshot(plan)
    } else {
        remove_marker = input.has_complete_marker;
        PlanOutcome::StaleResume
    };

    PlanDecision {
        outcome,
        remove_marker,
        drop_installed_record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DEFAULT_BRANCH;

    fn depot(id: DepotId, size: u64) -> DepotRecord {
        DepotRecord::new(id).with_manifest(DEFAULT_BRANCH, 1, size)
    }

    fn selection(depots: Vec<DepotRecord>) -> BTreeMap<DepotId, DepotRecord> {
        depots.into_iter().map(|d| (d.depot_id, d)).collect()
    }

    fn input<'a>(
        mode: RequestMode,
        selection: &'a BTreeMap<DepotId, DepotRecord>,
        scope: &'a [AppId],
    ) -> PlanInput<'a> {
        PlanInput {
            app_id: 100,
            mode,
            branch: DEFAULT_BRANCH,
            selection,
            dlc_scope: scope,
            main_app_dlc_ids: &[],
            snapshot: None,
            installed: None,
            installed_dlcs: HashMap::new(),
            has_complete_marker: false,
        }
    }

    fn expect_download(decision: PlanDecision) -> DownloadPlan {
        match decision.outcome {
            PlanOutcome::Download(plan) => plan,
            other => panic!("expected download, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_plan_with_nested_dlc() {
        let sel = selection(vec![depot(1, 500), depot(2, 300).with_dlc(200)]);
        let plan = expect_download(build_plan(input(RequestMode::Fresh, &sel, &[200])));

        assert_eq!(plan.total_bytes, 800);
        assert_eq!(plan.selected_depot_ids, vec![1, 2]);
        assert_eq!(
            plan.work_items,
            vec![
                WorkItem {
                    app_id: 100,
                    depot_ids: vec![1]
                },
                WorkItem {
                    app_id: 200,
                    depot_ids: vec![2]
                },
            ]
        );
        assert_eq!(plan.owners.len(), 2);
        assert_eq!(plan.dlc_app_ids, vec![200]);
    }

    #[test]
    fn test_dlc_outside_scope_excluded() {
        let sel = selection(vec![depot(1, 500), depot(2, 300).with_dlc(200)]);
        let plan = expect_download(build_plan(input(RequestMode::Fresh, &sel, &[])));

        assert_eq!(plan.selected_depot_ids, vec![1]);
        assert_eq!(plan.total_bytes, 500);
    }

    #[test]
    fn test_resume_prunes_completed_depots() {
        let sel = selection(vec![depot(5, 100), depot(7, 200), depot(9, 300)]);
        let mut plan_input = input(RequestMode::Resume, &sel, &[]);
        plan_input.snapshot = Some(ResumeSnapshot::new(350, [5, 7]));

        let plan = expect_download(build_plan(plan_input));

        assert_eq!(plan.work_items[0].depot_ids, vec![9]);
        assert_eq!(plan.total_bytes, 600);
        assert_eq!(plan.resumed_bytes, 350);
        assert_eq!(plan.partial_bytes_already_counted(), 50);
        assert_eq!(plan.pre_snapshot_depot_ids, vec![5, 7, 9]);
    }

    #[test]
    fn test_fresh_ignores_snapshot() {
        let sel = selection(vec![depot(5, 100), depot(7, 200)]);
        let mut plan_input = input(RequestMode::Fresh, &sel, &[]);
        plan_input.snapshot = Some(ResumeSnapshot::new(300, [5, 7]));

        let plan = expect_download(build_plan(plan_input));
        assert_eq!(plan.selected_depot_ids, vec![5, 7]);
        assert_eq!(plan.resumed_bytes, 0);
    }

    #[test]
    fn test_snapshot_covering_selection_finalizes() {
        let sel = selection(vec![depot(5, 100), depot(7, 200)]);
        let mut plan_input = input(RequestMode::Resume, &sel, &[]);
        plan_input.snapshot = Some(ResumeSnapshot::new(300, [5, 7]));

        let decision = build_plan(plan_input);
        assert!(matches!(decision.outcome, PlanOutcome::FinalizeFromSnapshot(_)));
    }

    #[test]
    fn test_trusted_install_prunes_main_depots() {
        let sel = selection(vec![depot(1, 100), depot(2, 200)]);
        let mut plan_input = input(RequestMode::Fresh, &sel, &[]);
        plan_input.has_complete_marker = true;
        plan_input.installed = Some(InstalledAppRecord {
            app_id: 100,
            is_downloaded: true,
            downloaded_depot_ids: vec![1],
            dlc_depot_ids: vec![],
        });

        let plan = expect_download(build_plan(plan_input));
        assert_eq!(plan.selected_depot_ids, vec![2]);
        assert_eq!(plan.owners[0].depot_ids, vec![1, 2]);
    }

    #[test]
    fn test_everything_installed_is_nothing_to_do() {
        let sel = selection(vec![depot(1, 100)]);
        let mut plan_input = input(RequestMode::Fresh, &sel, &[]);
        plan_input.has_complete_marker = true;
        plan_input.installed = Some(InstalledAppRecord {
            app_id: 100,
            is_downloaded: true,
            downloaded_depot_ids: vec![1],
            dlc_depot_ids: vec![],
        });

        let decision = build_plan(plan_input);
        assert!(matches!(
            decision.outcome,
            PlanOutcome::NothingToDo {
                clear_resume_state: false
            }
        ));
        assert!(!decision.drop_installed_record);
    }

    #[test]
    fn test_update_keeps_installed_depots() {
        let sel = selection(vec![depot(1, 100), depot(2, 200)]);
        let mut plan_input = input(RequestMode::Update, &sel, &[]);
        plan_input.has_complete_marker = true;
        plan_input.installed = Some(InstalledAppRecord {
            app_id: 100,
            is_downloaded: true,
            downloaded_depot_ids: vec![1, 2],
            dlc_depot_ids: vec![],
        });

        let plan = expect_download(build_plan(plan_input));
        assert_eq!(plan.selected_depot_ids, vec![1, 2]);
    }

    #[test]
    fn test_untrusted_install_record_dropped() {
        let sel = selection(vec![depot(1, 100)]);
        let mut plan_input = input(RequestMode::Fresh, &sel, &[]);
        plan_input.installed = Some(InstalledAppRecord {
            app_id: 100,
            is_downloaded: true,
            downloaded_depot_ids: vec![1],
            dlc_depot_ids: vec![],
        });

        let decision = build_plan(plan_input);
        assert!(decision.drop_installed_record);
        assert_eq!(expect_download(decision).selected_depot_ids, vec![1]);
    }

    #[test]
    fn test_resume_with_marker_revokes_marker() {
        let sel = selection(vec![depot(5, 100), depot(7, 200)]);
        let mut plan_input = input(RequestMode::Resume, &sel, &[]);
        plan_input.has_complete_marker = true;
        plan_input.snapshot = Some(ResumeSnapshot::new(100, [5]));

        let decision = build_plan(plan_input);
        assert!(decision.remove_marker);
        assert_eq!(expect_download(decision).selected_depot_ids, vec![7]);
    }
}
