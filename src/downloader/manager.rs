//! 下载编排器
//!
//! 对外入口：把一次下载请求分类、选择 depot、规划工作集，
//! 然后驱动传输引擎并处理完成 / 暂停 / 失败 / 删除四种收尾。
//!
//! ## 设计原则
//!
//! - 同一应用的请求处理串行化，注册表保证同时最多一个任务
//! - 暂停保留 pending 记录与快照；失败清除 pending 记录与续传范围
//! - 删除取消不写任何续传状态，也不报告为暂停或失败
//! - 清理类操作尽力而为，失败只记录日志

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classify::{
    classify_request, resolve_resume_scope, DiskEvidence, DownloadRequest, RequestMode,
    ScopeCandidates,
};
use super::engine::{
    TransferEngine, TransferEngineFactory, TransferError, TransferItem, TransferOptions,
};
use super::events::DownloadEvent;
use super::listener::JobTransferListener;
use super::plan::{build_plan, DownloadPlan, PlanInput, PlanOutcome};
use super::registry::DownloadJobRegistry;
use super::selector::{main_app_dlc_ids_without_depot_tags, select_downloadable_depots};
use super::task::{DownloadJob, DownloadPhase};
use crate::catalog::{
    AppId, CatalogApp, CatalogService, CatalogSnapshot, DepotId, DepotRecord, InstalledAppRecord,
    OwnershipContext,
};
use crate::common::{retry_with_linear_backoff, ConnectivityEvent, NetworkGate, SyncError, SyncGate};
use crate::config::{AppConfig, DownloadConfig, PathValidator, SyncConfig};
use crate::persistence::{
    add_marker, clear_progress_files, delete_resume_scope, delete_snapshot, has_marker,
    has_resume_metadata, load_resume_scope, load_snapshot, persist_resume_scope, remove_marker,
    InstallStateResult, InstallStateStore,
};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 删除目录的重试次数
const DELETE_DIR_ATTEMPTS: u32 = 5;

/// 删除目录的重试间隔
const DELETE_DIR_RETRY_DELAY: Duration = Duration::from_millis(250);

/// 下载编排器
pub struct DownloadOrchestrator {
    config: DownloadConfig,
    sync_config: SyncConfig,
    catalog: Arc<dyn CatalogService>,
    install_state: Arc<dyn InstallStateStore>,
    engine_factory: Arc<dyn TransferEngineFactory>,
    registry: DownloadJobRegistry,
    sync_gate: SyncGate,
    network_gate: NetworkGate,
    events: broadcast::Sender<DownloadEvent>,
    /// 每个应用的请求处理锁
    request_locks: DashMap<AppId, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("install_dir", &self.config.install_dir)
            .field("jobs", &self.registry.len())
            .finish()
    }
}

/// 请求处理锁的持有凭证
struct RequestLease<'a> {
    locks: &'a DashMap<AppId, Arc<tokio::sync::Mutex<()>>>,
    app_id: AppId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RequestLease<'_> {
    fn drop(&mut self) {
        // 先解锁，此后只剩表内引用说明无人等待
        drop(self.guard.take());
        self.locks
            .remove_if(&self.app_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// 续传判定结果的附带信息
struct RequestContext {
    app_dir: PathBuf,
    mode: RequestMode,
    evidence: DiskEvidence,
}

impl DownloadOrchestrator {
    /// 创建编排器
    ///
    /// # Arguments
    /// * `config` - 应用配置
    /// * `catalog` - 目录服务
    /// * `install_state` - 安装状态存储
    /// * `engine_factory` - 传输引擎工厂
    pub fn new(
        config: &AppConfig,
        catalog: Arc<dyn CatalogService>,
        install_state: Arc<dyn InstallStateStore>,
        engine_factory: Arc<dyn TransferEngineFactory>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config: config.download.clone(),
            sync_config: config.sync.clone(),
            catalog,
            install_state,
            engine_factory,
            registry: DownloadJobRegistry::new(),
            sync_gate: SyncGate::new(),
            network_gate: NetworkGate::new(config.network.wifi_only),
            events,
            request_locks: DashMap::new(),
        })
    }

    /// 订阅下载事件
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// 获取应用的任务
    pub fn job(&self, app_id: AppId) -> Option<Arc<DownloadJob>> {
        self.registry.get(app_id)
    }

    pub fn network_gate(&self) -> &NetworkGate {
        &self.network_gate
    }

    fn publish(&self, event: DownloadEvent) {
        debug!("发布事件: {}", event.event_type());
        let _ = self.events.send(event);
    }

    fn notice(&self, message: impl Into<String>) {
        self.publish(DownloadEvent::Notice {
            message: message.into(),
        });
    }

    /// 获取应用的请求处理锁
    ///
    /// 返回的租约释放时，若没有其他请求在等待该锁，则回收锁条目
    async fn lock_request(&self, app_id: AppId) -> RequestLease<'_> {
        let lock = self
            .request_locks
            .entry(app_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        RequestLease {
            locks: &self.request_locks,
            app_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    // ========================================================================
    // 入口
    // ========================================================================

    /// 安装或继续安装
    ///
    /// # Returns
    /// - `Ok(Some(job))`: 新任务或已在运行的任务
    /// - `Ok(None)`: 无事可做或被网络策略阻止
    pub async fn download(self: &Arc<Self>, app_id: AppId) -> Result<Option<Arc<DownloadJob>>> {
        self.start(app_id, DownloadRequest::Install { dlc_app_ids: None })
            .await
    }

    /// 安装并显式指定 DLC 范围
    pub async fn download_with_dlcs(
        self: &Arc<Self>,
        app_id: AppId,
        dlc_app_ids: Vec<AppId>,
    ) -> Result<Option<Arc<DownloadJob>>> {
        self.start(
            app_id,
            DownloadRequest::Install {
                dlc_app_ids: Some(dlc_app_ids),
            },
        )
        .await
    }

    /// 更新：包含已下载 depot 与已安装 DLC
    pub async fn download_for_update(
        self: &Arc<Self>,
        app_id: AppId,
    ) -> Result<Option<Arc<DownloadJob>>> {
        self.start(app_id, DownloadRequest::Update).await
    }

    /// 校验：depot 集合同更新，不信任已完成状态
    pub async fn download_for_verify(
        self: &Arc<Self>,
        app_id: AppId,
    ) -> Result<Option<Arc<DownloadJob>>> {
        self.start(app_id, DownloadRequest::Verify).await
    }

    /// 暂停应用的活动任务
    pub fn pause(&self, app_id: AppId) -> bool {
        match self.registry.get_active(app_id) {
            Some(job) => {
                info!("暂停下载: app_id={}", app_id);
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// 是否有下载任务或同步操作在进行
    pub fn has_active_operations(&self) -> bool {
        !self.registry.active_jobs().is_empty() || self.sync_gate.any_held()
    }

    async fn start(
        self: &Arc<Self>,
        app_id: AppId,
        request: DownloadRequest,
    ) -> Result<Option<Arc<DownloadJob>>> {
        if let Some(job) = self.registry.get_active(app_id) {
            debug!("已有活动任务，直接返回: app_id={}", app_id);
            return Ok(Some(job));
        }

        if self.network_gate.is_blocked() {
            info!("仅 Wi-Fi 下载策略生效，拒绝下载: app_id={}", app_id);
            self.notice("当前网络不是 Wi-Fi，已按设置暂停下载");
            return Ok(None);
        }

        let _lease = self.lock_request(app_id).await;

        if let Some(job) = self.registry.get_active(app_id) {
            return Ok(Some(job));
        }
        if let Some(previous) = self.registry.get(app_id) {
            // 上一个任务已停用但仍在收尾
            if !previous
                .await_completion(self.config.delete_wait_timeout())
                .await
            {
                warn!("等待上一个任务收尾超时: app_id={}", app_id);
            }
        }

        let (catalog, ownership) = self.load_catalog(app_id).await?;
        let ctx = self.classify(app_id, &request).await;
        info!(
            "下载请求分类: app_id={}, mode={:?}, evidence={:?}",
            app_id, ctx.mode, ctx.evidence
        );

        let selection = select_downloadable_depots(&catalog, &ownership, &self.config.language);
        let dlc_scope = self.resolve_dlc_scope(app_id, &request, &ctx, &selection, &ownership);
        debug!("DLC 范围: app_id={}, dlcs={:?}", app_id, dlc_scope);

        let installed = self.store_read(self.install_state.installed_record(app_id), "读取安装记录");
        let installed_dlcs: HashMap<AppId, InstalledAppRecord> = dlc_scope
            .iter()
            .filter_map(|dlc| {
                self.store_read(self.install_state.installed_record(*dlc), "读取 DLC 安装记录")
                    .map(|record| (*dlc, record))
            })
            .collect();
        let main_app_dlc_ids =
            main_app_dlc_ids_without_depot_tags(&catalog.app, &catalog.hidden_dlc_app_ids);

        let decision = build_plan(PlanInput {
            app_id,
            mode: ctx.mode,
            branch: &catalog.branch,
            selection: &selection,
            dlc_scope: &dlc_scope,
            main_app_dlc_ids: &main_app_dlc_ids,
            snapshot: load_snapshot(&ctx.app_dir),
            installed,
            installed_dlcs,
            has_complete_marker: ctx.evidence.has_complete_marker,
        });

        if decision.remove_marker && remove_marker(&ctx.app_dir) {
            info!("快照显示安装不完整，撤销完成标记: app_id={}", app_id);
        }
        if decision.drop_installed_record {
            info!("安装记录不可信，已删除: app_id={}", app_id);
            self.store_write(self.install_state.delete_installed_record(app_id), "删除安装记录");
        }

        match decision.outcome {
            PlanOutcome::NothingToDo { clear_resume_state } => {
                info!("没有需要下载的 depot: app_id={}", app_id);
                if clear_resume_state {
                    self.clear_resume_state(app_id, &ctx.app_dir);
                }
                self.notice("没有需要下载的内容");
                Ok(None)
            }
            PlanOutcome::StaleResume => {
                warn!("续传状态与 depot 选择不一致，重置: app_id={}", app_id);
                self.clear_resume_state(app_id, &ctx.app_dir);
                self.notice("没有需要下载的内容");
                Ok(None)
            }
            PlanOutcome::FinalizeFromSnapshot(plan) => {
                info!("快照已覆盖全部 depot，直接完成安装: app_id={}", app_id);
                self.finalize_install(&plan, &ctx.app_dir);
                self.publish(DownloadEvent::Completed {
                    app_id,
                    completed_at: chrono::Utc::now().timestamp(),
                });
                Ok(None)
            }
            PlanOutcome::Download(plan) => self.launch(plan, ctx).map(Some),
        }
    }

    /// 读取目录信息
    async fn load_catalog(&self, app_id: AppId) -> Result<(CatalogSnapshot, OwnershipContext)> {
        let depots = self
            .catalog
            .app_depots(app_id)
            .await
            .context("读取应用 depot 失败")?
            .with_context(|| format!("目录中不存在应用: {}", app_id))?;

        let mut indirect_dlc_apps = Vec::new();
        let dlc_apps = self
            .catalog
            .dlc_apps_of(app_id)
            .await
            .context("读取 DLC 列表失败")?;
        for dlc_app_id in dlc_apps {
            match self.catalog.app_depots(dlc_app_id).await {
                Ok(Some(depots)) => indirect_dlc_apps.push(CatalogApp {
                    app_id: dlc_app_id,
                    depots,
                }),
                Ok(None) => debug!("间接 DLC 没有 depot 数据: dlc={}", dlc_app_id),
                Err(e) => warn!("读取间接 DLC 失败: dlc={}, 错误: {:#}", dlc_app_id, e),
            }
        }

        let hidden_dlc_app_ids = self
            .catalog
            .hidden_dlc_apps_of(app_id)
            .await
            .unwrap_or_else(|e| {
                warn!("读取隐藏 DLC 列表失败: app_id={}, 错误: {:#}", app_id, e);
                Vec::new()
            });
        let owned = self
            .catalog
            .owned_dlc_app_ids(app_id)
            .await
            .context("读取 DLC 所有权失败")?;

        Ok((
            CatalogSnapshot {
                app: CatalogApp { app_id, depots },
                indirect_dlc_apps,
                hidden_dlc_app_ids,
                branch: self.config.branch.clone(),
            },
            OwnershipContext {
                owned_dlc_app_ids: owned,
            },
        ))
    }

    async fn app_dir(&self, app_id: AppId) -> PathBuf {
        let dir_name = self
            .catalog
            .install_dir_name(app_id)
            .await
            .unwrap_or_else(|e| {
                warn!("读取安装目录名失败: app_id={}, 错误: {:#}", app_id, e);
                None
            });
        self.config.app_dir(app_id, dir_name.as_deref())
    }

    async fn classify(&self, app_id: AppId, request: &DownloadRequest) -> RequestContext {
        let app_dir = self.app_dir(app_id).await;
        let pending = self.store_read(self.install_state.pending_download(app_id), "读取 pending 记录");
        let evidence = DiskEvidence::inspect(&app_dir, pending.is_some());
        RequestContext {
            mode: classify_request(request, &evidence),
            app_dir,
            evidence,
        }
    }

    /// 解析本次包含的 DLC
    ///
    /// - 全新安装：显式参数，否则为选择中全部已拥有的 DLC
    /// - 续传：按优先级链恢复
    /// - 更新 / 校验：已安装的 DLC
    fn resolve_dlc_scope(
        &self,
        app_id: AppId,
        request: &DownloadRequest,
        ctx: &RequestContext,
        selection: &std::collections::BTreeMap<DepotId, DepotRecord>,
        ownership: &OwnershipContext,
    ) -> Vec<AppId> {
        let explicit = match request {
            DownloadRequest::Install { dlc_app_ids } => dlc_app_ids.clone(),
            _ => None,
        };
        let selected_dlcs: BTreeSet<AppId> =
            selection.values().filter_map(|d| d.dlc_app_id).collect();
        let installed: Vec<AppId> = selected_dlcs
            .iter()
            .copied()
            .filter(|dlc| {
                self.store_read(self.install_state.installed_record(*dlc), "读取 DLC 安装记录")
                    .map_or(false, |r| r.is_downloaded)
            })
            .collect();

        match ctx.mode {
            RequestMode::Fresh => explicit.unwrap_or_else(|| {
                selected_dlcs
                    .iter()
                    .copied()
                    .filter(|dlc| ownership.allows(*dlc))
                    .collect()
            }),
            RequestMode::Update | RequestMode::Verify => installed,
            RequestMode::Resume => {
                let inferred: Vec<AppId> = load_snapshot(&ctx.app_dir)
                    .map(|snapshot| {
                        snapshot
                            .completed_depot_ids
                            .iter()
                            .filter_map(|id| selection.get(id).and_then(|d| d.dlc_app_id))
                            .collect::<BTreeSet<_>>()
                            .into_iter()
                            .collect()
                    })
                    .unwrap_or_default();
                let candidates = ScopeCandidates {
                    explicit,
                    pending: self.store_read(
                        self.install_state.pending_download(app_id),
                        "读取 pending 记录",
                    ),
                    persisted: load_resume_scope(&ctx.app_dir, app_id),
                    inferred,
                    installed,
                };
                let (scope, source) = resolve_resume_scope(candidates);
                debug!("续传范围来源: app_id={}, {:?}", app_id, source);
                scope
            }
        }
    }

    /// 启动任务
    fn launch(self: &Arc<Self>, plan: DownloadPlan, ctx: RequestContext) -> Result<Arc<DownloadJob>> {
        let app_id = plan.app_id;
        PathValidator::ensure_directory_exists(&ctx.app_dir)?;

        if !plan.mode.allows_persisted_progress() && delete_snapshot(&ctx.app_dir) {
            debug!("非续传模式，丢弃旧快照: app_id={}", app_id);
        }
        self.store_write(
            self.install_state
                .upsert_pending_download(app_id, &plan.dlc_app_ids),
            "写入 pending 记录",
        );
        if let Err(e) = persist_resume_scope(&ctx.app_dir, app_id, &plan.dlc_app_ids) {
            warn!("保存续传范围失败: app_id={}, 错误: {}", app_id, e);
        }

        let job = Arc::new(DownloadJob::from_plan(
            &plan,
            ctx.app_dir.clone(),
            self.config.snapshot_flush_interval(),
        ));
        let job = match self.registry.try_insert(job) {
            Ok(job) => job,
            Err(existing) => return Ok(existing),
        };

        job.set_phase(DownloadPhase::Preparing, None);
        self.publish(DownloadEvent::Started {
            app_id,
            job_id: job.id().to_string(),
            mode: format!("{:?}", plan.mode).to_lowercase(),
            depot_ids: plan.selected_depot_ids.clone(),
            dlc_app_ids: plan.dlc_app_ids.clone(),
            total_bytes: plan.total_bytes,
            resumed_bytes: plan.resumed_bytes,
        });
        self.publish(DownloadEvent::StatusChanged {
            app_id,
            old_phase: DownloadPhase::Unknown.as_str().to_string(),
            new_phase: DownloadPhase::Preparing.as_str().to_string(),
        });
        info!(
            "下载任务已启动: app_id={}, mode={:?}, depots={:?}, 总字节={}, 已下载={}",
            app_id, plan.mode, plan.selected_depot_ids, plan.total_bytes, plan.resumed_bytes
        );

        let orchestrator = Arc::clone(self);
        let run_job = Arc::clone(&job);
        tokio::spawn(async move {
            orchestrator.run(run_job, plan).await;
        });

        Ok(job)
    }

    // ========================================================================
    // 任务执行
    // ========================================================================

    async fn run(&self, job: Arc<DownloadJob>, plan: DownloadPlan) {
        let result = self.drive_transfer(&job, &plan).await;
        let app_id = job.app_id();

        if job.is_deleting() {
            debug!("任务因删除结束: app_id={}", app_id);
            job.set_active(false);
        } else if let Some(message) = job.failure() {
            self.handle_failed(&job, &message);
        } else {
            match result {
                Err(TransferError::Cancelled) => self.handle_paused(&job).await,
                Err(e) => self.handle_failed(&job, &e.to_string()),
                Ok(()) if job.is_cancelled() => self.handle_paused(&job).await,
                Ok(()) => {
                    if self.await_depot_callbacks(&job, &plan).await {
                        self.handle_completed(&job, &plan);
                    } else if job.is_deleting() {
                        job.set_active(false);
                    } else {
                        warn!(
                            "传输结束但仍有 depot 未完成，按暂停处理: app_id={}, 已完成={:?}",
                            app_id,
                            job.tracker().completed_depot_ids()
                        );
                        self.handle_paused(&job).await;
                    }
                }
            }
        }

        self.registry.remove(app_id, &job);
        job.mark_finished();
    }

    async fn drive_transfer(
        &self,
        job: &Arc<DownloadJob>,
        plan: &DownloadPlan,
    ) -> Result<(), TransferError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let options = TransferOptions::from_speed_profile(self.config.download_speed, cores);
        let cancel_token = job.cancel_token();

        let engine = self
            .engine_factory
            .create(cancel_token.clone(), options)
            .map_err(|e| TransferError::Failed(format!("{:#}", e)))?;

        engine.add_listener(Arc::new(JobTransferListener::new(
            Arc::clone(job),
            self.events.clone(),
            plan.partial_bytes_already_counted(),
            plan.resumed_bytes > 0,
            self.config.phase_flicker_window(),
            self.config.progress_event_interval(),
        )));

        let result = self
            .feed_and_wait(engine.as_ref(), job, plan, &cancel_token)
            .await;
        engine.close().await;
        result
    }

    async fn feed_and_wait(
        &self,
        engine: &dyn TransferEngine,
        job: &DownloadJob,
        plan: &DownloadPlan,
        cancel_token: &CancellationToken,
    ) -> Result<(), TransferError> {
        for item in &plan.work_items {
            engine.enqueue(TransferItem {
                app_id: item.app_id,
                install_dir: job.app_dir().to_path_buf(),
                depot_ids: item.depot_ids.clone(),
                branch: self.config.branch.clone(),
                verify: plan.mode.is_verify(),
            })?;
        }
        engine.finish_adding();
        engine.start()?;

        tokio::select! {
            biased;
            result = engine.completion() => result,
            _ = cancel_token.cancelled() => Err(TransferError::Cancelled),
        }
    }

    /// 引擎报告完成后，等待最后的 depot 完成回调
    async fn await_depot_callbacks(&self, job: &DownloadJob, plan: &DownloadPlan) -> bool {
        let tracked = &plan.pre_snapshot_depot_ids;
        for _ in 0..self.config.completion_poll_attempts {
            if job.tracker().all_completed(tracked.iter()) {
                return true;
            }
            if job.is_cancelled() {
                return false;
            }
            tokio::time::sleep(self.config.completion_poll_interval()).await;
        }
        job.tracker().all_completed(tracked.iter())
    }

    fn handle_completed(&self, job: &Arc<DownloadJob>, plan: &DownloadPlan) {
        let app_id = job.app_id();
        job.clear_snapshot();
        self.finalize_install(plan, job.app_dir());
        job.tracker().settle_bytes();
        job.set_active(false);

        let old = job.set_phase(DownloadPhase::Complete, None);
        self.publish(DownloadEvent::StatusChanged {
            app_id,
            old_phase: old.as_str().to_string(),
            new_phase: DownloadPhase::Complete.as_str().to_string(),
        });
        self.publish(DownloadEvent::Completed {
            app_id,
            completed_at: chrono::Utc::now().timestamp(),
        });
        info!("下载完成: app_id={}", app_id);
    }

    async fn handle_paused(&self, job: &Arc<DownloadJob>) {
        let app_id = job.app_id();
        job.flush_snapshot().await;
        job.set_active(false);

        let old = job.set_phase(DownloadPhase::Paused, None);
        self.publish(DownloadEvent::StatusChanged {
            app_id,
            old_phase: old.as_str().to_string(),
            new_phase: DownloadPhase::Paused.as_str().to_string(),
        });
        self.publish(DownloadEvent::Paused { app_id });
        info!("下载已暂停: app_id={}", app_id);
    }

    fn handle_failed(&self, job: &Arc<DownloadJob>, message: &str) {
        let app_id = job.app_id();
        error!("下载失败: app_id={}, 错误: {}", app_id, message);

        job.persist_failed_snapshot();
        job.clear_snapshot();
        delete_resume_scope(job.app_dir());
        self.store_write(
            self.install_state.delete_pending_download(app_id),
            "删除 pending 记录",
        );
        job.set_active(false);

        let old = job.set_phase(DownloadPhase::Failed, Some(message.to_string()));
        self.publish(DownloadEvent::StatusChanged {
            app_id,
            old_phase: old.as_str().to_string(),
            new_phase: DownloadPhase::Failed.as_str().to_string(),
        });
        self.publish(DownloadEvent::Failed {
            app_id,
            error: message.to_string(),
        });
        self.notice(format!("下载失败: {}", message));
    }

    /// 写入安装记录与完成标记，清除续传状态
    fn finalize_install(&self, plan: &DownloadPlan, app_dir: &Path) {
        for owner in &plan.owners {
            let mut record = self
                .store_read(self.install_state.installed_record(owner.app_id), "读取安装记录")
                .unwrap_or_else(|| InstalledAppRecord {
                    app_id: owner.app_id,
                    ..Default::default()
                });
            record.merge(&owner.depot_ids, &owner.dlc_ids);
            self.store_write(
                self.install_state.upsert_installed_record(&record),
                "写入安装记录",
            );
        }

        if let Err(e) = add_marker(app_dir) {
            warn!("写入完成标记失败: {:?}, 错误: {}", app_dir, e);
        }
        self.clear_resume_state(plan.app_id, app_dir);
    }

    /// 清除快照、续传范围与 pending 记录
    fn clear_resume_state(&self, app_id: AppId, app_dir: &Path) {
        clear_progress_files(app_dir);
        self.store_write(
            self.install_state.delete_pending_download(app_id),
            "删除 pending 记录",
        );
    }

    // ========================================================================
    // 查询 / 删除
    // ========================================================================

    /// 是否存在可续传的部分下载
    ///
    /// 不可续传时顺带清理过期的 pending 记录与快照
    pub async fn has_partial_download(&self, app_id: AppId) -> bool {
        let app_dir = self.app_dir(app_id).await;
        let pending = self.store_read(self.install_state.pending_download(app_id), "读取 pending 记录");
        let evidence = DiskEvidence::inspect(&app_dir, pending.is_some());
        if evidence.has_partial_download() {
            return true;
        }

        if pending.is_some() {
            debug!("清理过期 pending 记录: app_id={}", app_id);
            self.store_write(
                self.install_state.delete_pending_download(app_id),
                "删除 pending 记录",
            );
        }
        if has_marker(&app_dir) && !has_resume_metadata(&app_dir) {
            clear_progress_files(&app_dir);
        }
        false
    }

    /// 删除应用的安装内容
    ///
    /// # Returns
    /// - `Ok(false)`: 路径不安全（例如解析为安装根目录），未删除
    /// - `Ok(true)`: 已删除
    pub async fn delete_installed_content(&self, app_id: AppId) -> Result<bool> {
        let app_dir = self.app_dir(app_id).await;
        if !PathValidator::is_safe_delete_target(&app_dir, &self.config.install_roots()) {
            warn!("拒绝删除不安全的路径: app_id={}, path={:?}", app_id, app_dir);
            return Ok(false);
        }

        let _lease = self.lock_request(app_id).await;

        if let Some(job) = self.registry.get(app_id) {
            info!("删除前取消下载任务: app_id={}", app_id);
            job.mark_deleting();
            job.cancel();
            if !job.await_completion(self.config.delete_wait_timeout()).await {
                warn!("等待任务退出超时，继续删除: app_id={}", app_id);
            }
        }

        remove_marker(&app_dir);
        clear_progress_files(&app_dir);

        let mut owned_apps: BTreeSet<AppId> = BTreeSet::from([app_id]);
        match self.catalog.dlc_apps_of(app_id).await {
            Ok(dlcs) => owned_apps.extend(dlcs),
            Err(e) => warn!("读取 DLC 列表失败: app_id={}, 错误: {:#}", app_id, e),
        }
        if let Ok(Some(depots)) = self.catalog.app_depots(app_id).await {
            owned_apps.extend(depots.values().filter_map(|d| d.dlc_app_id));
        }
        for id in &owned_apps {
            self.store_write(self.install_state.delete_installed_record(*id), "删除安装记录");
        }
        self.store_write(
            self.install_state.delete_pending_download(app_id),
            "删除 pending 记录",
        );

        remove_dir_with_retry(&app_dir).await?;
        self.publish(DownloadEvent::Deleted { app_id });
        info!("已删除安装内容: app_id={}, path={:?}", app_id, app_dir);
        Ok(true)
    }

    // ========================================================================
    // 网络策略
    // ========================================================================

    /// 处理连接事件
    ///
    /// 仅 Wi-Fi 策略下失去不计流量网络时暂停全部任务，返回暂停数量
    pub fn handle_connectivity(&self, event: ConnectivityEvent) -> usize {
        if !self.network_gate.apply(event) {
            return 0;
        }
        self.pause_all_for_connectivity()
    }

    /// 开关仅 Wi-Fi 策略
    pub fn set_wifi_only(&self, enabled: bool) -> usize {
        self.network_gate.set_wifi_only(enabled);
        if self.network_gate.is_blocked() {
            self.pause_all_for_connectivity()
        } else {
            0
        }
    }

    fn pause_all_for_connectivity(&self) -> usize {
        let jobs = self.registry.active_jobs();
        for job in &jobs {
            info!("网络不满足仅 Wi-Fi 策略，暂停: app_id={}", job.app_id());
            job.cancel();
            self.publish(DownloadEvent::PausedDueToConnectivity {
                app_id: job.app_id(),
            });
        }
        if !jobs.is_empty() {
            self.notice("已离开 Wi-Fi 网络，下载已暂停");
        }
        jobs.len()
    }

    /// 订阅连接事件流
    pub fn watch_connectivity(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ConnectivityEvent>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("连接事件: {:?}", event);
                orchestrator.handle_connectivity(event);
            }
            debug!("连接事件流已关闭");
        })
    }

    // ========================================================================
    // 同步操作
    // ========================================================================

    /// 执行同步类操作
    ///
    /// 同一应用同时只允许一个；瞬时错误按线性退避重试
    pub async fn run_sync<T, F, Fut>(&self, app_id: AppId, operation: F) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let _guard = self
            .sync_gate
            .try_acquire(app_id)
            .ok_or(SyncError::InProgress(app_id))?;

        retry_with_linear_backoff(
            self.sync_config.max_attempts,
            self.sync_config.retry_base_delay(),
            SyncError::is_transient,
            operation,
        )
        .await
    }

    // ========================================================================
    // 存储辅助
    // ========================================================================

    fn store_read<T>(&self, result: InstallStateResult<Option<T>>, what: &str) -> Option<T> {
        result.unwrap_or_else(|e| {
            warn!("{}失败: {}", what, e);
            None
        })
    }

    fn store_write(&self, result: InstallStateResult<()>, what: &str) {
        if let Err(e) = result {
            warn!("{}失败: {}", what, e);
        }
    }
}

/// 删除目录（失败时重试）
async fn remove_dir_with_retry(dir: &Path) -> Result<()> {
    let mut attempt = 1;
    loop {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < DELETE_DIR_ATTEMPTS => {
                warn!(
                    "删除目录失败，{}ms 后重试 ({}/{}): {:?}, 错误: {}",
                    DELETE_DIR_RETRY_DELAY.as_millis(),
                    attempt,
                    DELETE_DIR_ATTEMPTS,
                    dir,
                    e
                );
                tokio::time::sleep(DELETE_DIR_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("删除安装目录失败: {:?}", dir));
            }
        }
    }
}
