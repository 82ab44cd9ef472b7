use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classify::RequestMode;
use super::plan::DownloadPlan;
use super::progress::{ListenerId, ProgressListener, ProgressTracker};
use crate::catalog::{AppId, DepotId};
use crate::persistence::{delete_snapshot, save_failed_snapshot, save_snapshot, ResumeSnapshot};

/// 下载阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    /// 尚未开始
    Unknown,
    /// 准备中
    Preparing,
    /// 下载中
    Downloading,
    /// 校验中
    Verifying,
    /// 已暂停
    Paused,
    /// 失败
    Failed,
    /// 已完成
    Complete,
}

impl DownloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadPhase::Unknown => "unknown",
            DownloadPhase::Preparing => "preparing",
            DownloadPhase::Downloading => "downloading",
            DownloadPhase::Verifying => "verifying",
            DownloadPhase::Paused => "paused",
            DownloadPhase::Failed => "failed",
            DownloadPhase::Complete => "complete",
        }
    }

    /// 从注册表角度是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadPhase::Paused | DownloadPhase::Failed | DownloadPhase::Complete
        )
    }
}

/// 快照持久化状态
///
/// 回调只标记 dirty，按最小间隔节流落盘；终态转换时强制同步落盘。
/// 清除快照会递增代数，在此之前排队的写入被丢弃。
#[derive(Debug)]
struct SnapshotPersister {
    min_interval: Duration,
    dirty: AtomicBool,
    flush_scheduled: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    last_persist: Mutex<Option<Instant>>,
    write_lock: Mutex<()>,
}

/// 下载任务
///
/// 每个正在下载的安装目标一个，由注册表持有
pub struct DownloadJob {
    id: String,
    app_id: AppId,
    app_dir: PathBuf,
    mode: RequestMode,
    /// 本次工作集 depot
    depot_ids: Vec<DepotId>,
    /// 捆绑的 DLC
    dlc_app_ids: Vec<AppId>,
    /// 工作项应用 -> depot
    item_depots: HashMap<AppId, Vec<DepotId>>,
    tracker: ProgressTracker,
    phase_tx: watch::Sender<DownloadPhase>,
    status_message: Mutex<Option<String>>,
    active: AtomicBool,
    deleting: AtomicBool,
    failure: Mutex<Option<String>>,
    cancel_token: CancellationToken,
    finished: CancellationToken,
    persister: SnapshotPersister,
    runtime: Option<Handle>,
    created_at: i64,
}

impl std::fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadJob")
            .field("id", &self.id)
            .field("app_id", &self.app_id)
            .field("mode", &self.mode)
            .field("phase", &self.phase())
            .field("depot_ids", &self.depot_ids)
            .finish()
    }
}

impl DownloadJob {
    /// 根据下载计划创建任务
    ///
    /// # Arguments
    /// * `plan` - 下载计划
    /// * `app_dir` - 安装目录
    /// * `snapshot_interval` - 节流落盘最小间隔
    pub fn from_plan(plan: &DownloadPlan, app_dir: PathBuf, snapshot_interval: Duration) -> Self {
        let tracker = ProgressTracker::new(
            &plan.selected_depot_ids,
            &plan.depot_sizes,
            plan.pre_snapshot_depot_ids.iter().copied(),
            plan.total_bytes,
        );
        if let Some(snapshot) = &plan.snapshot {
            tracker.initialize_completed(snapshot.completed_depot_ids.iter().copied());
        }
        tracker.set_initial_bytes(plan.resumed_bytes);

        let (phase_tx, _) = watch::channel(DownloadPhase::Unknown);

        Self {
            id: Uuid::new_v4().to_string(),
            app_id: plan.app_id,
            app_dir,
            mode: plan.mode,
            depot_ids: plan.selected_depot_ids.clone(),
            dlc_app_ids: plan.dlc_app_ids.clone(),
            item_depots: plan
                .work_items
                .iter()
                .map(|item| (item.app_id, item.depot_ids.clone()))
                .collect(),
            tracker,
            phase_tx,
            status_message: Mutex::new(None),
            active: AtomicBool::new(true),
            deleting: AtomicBool::new(false),
            failure: Mutex::new(None),
            cancel_token: CancellationToken::new(),
            finished: CancellationToken::new(),
            persister: SnapshotPersister {
                min_interval: snapshot_interval,
                dirty: AtomicBool::new(false),
                flush_scheduled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                last_persist: Mutex::new(None),
                write_lock: Mutex::new(()),
            },
            runtime: Handle::try_current().ok(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn depot_ids(&self) -> &[DepotId] {
        &self.depot_ids
    }

    pub fn dlc_app_ids(&self) -> &[AppId] {
        &self.dlc_app_ids
    }

    /// 某个工作项包含的 depot
    pub fn item_depot_ids(&self, app_id: AppId) -> &[DepotId] {
        self.item_depots.get(&app_id).map_or(&[], |ids| ids.as_slice())
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn progress(&self) -> f32 {
        self.tracker.progress()
    }

    /// 预计剩余时间（仅下载阶段）
    pub fn eta(&self) -> Option<Duration> {
        if self.phase() != DownloadPhase::Downloading {
            return None;
        }
        self.tracker.eta()
    }

    pub fn add_progress_listener(&self, listener: ProgressListener) -> ListenerId {
        self.tracker.add_listener(listener)
    }

    pub fn remove_progress_listener(&self, id: ListenerId) {
        self.tracker.remove_listener(id);
    }

    // ========================================================================
    // 阶段
    // ========================================================================

    pub fn phase(&self) -> DownloadPhase {
        *self.phase_tx.borrow()
    }

    /// 订阅阶段变化
    pub fn subscribe_phase(&self) -> watch::Receiver<DownloadPhase> {
        self.phase_tx.subscribe()
    }

    /// 切换阶段，返回旧阶段
    pub fn set_phase(&self, phase: DownloadPhase, message: Option<String>) -> DownloadPhase {
        let old = self.phase_tx.send_replace(phase);
        if phase == DownloadPhase::Downloading
            && !matches!(old, DownloadPhase::Downloading | DownloadPhase::Unknown)
        {
            self.tracker.reset_speed_tracking();
        }
        if message.is_some() {
            *self.status_message.lock() = message;
        }
        if old != phase {
            debug!("任务阶段变更: app_id={}, {:?} -> {:?}", self.app_id, old, phase);
        }
        old
    }

    pub fn status_message(&self) -> Option<String> {
        self.status_message.lock().clone()
    }

    pub fn set_status_message(&self, message: &str) {
        *self.status_message.lock() = Some(message.to_string());
    }

    // ========================================================================
    // 取消 / 失败 / 删除
    // ========================================================================

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    /// 标记为删除取消（之后不再写快照）
    pub fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::SeqCst);
        self.persister.closed.store(true, Ordering::SeqCst);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 协作式取消（暂停）
    ///
    /// 只发出取消信号，不做文件 IO；暂停快照由任务协程收尾时通过
    /// [`DownloadJob::flush_snapshot`] 写入
    pub fn cancel(&self) {
        self.set_active(false);
        self.cancel_token.cancel();
    }

    /// 记录传输失败并取消任务
    pub fn fail(&self, message: &str) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(message.to_string());
            }
        }
        self.set_active(false);
        self.cancel_token.cancel();
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// 任务协程退出时调用
    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// 等待任务协程退出
    ///
    /// # Returns
    /// 超时前退出返回 true
    pub async fn await_completion(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.finished.cancelled())
            .await
            .is_ok()
    }

    // ========================================================================
    // 快照
    // ========================================================================

    /// 当前内存中的快照
    pub fn current_snapshot(&self) -> ResumeSnapshot {
        let (bytes, _) = self.tracker.bytes_progress();
        ResumeSnapshot {
            bytes_downloaded: bytes,
            completed_depot_ids: self.tracker.completed_depot_ids(),
        }
    }

    pub fn mark_dirty(&self) {
        self.persister.dirty.store(true, Ordering::SeqCst);
    }

    /// 持久化快照
    ///
    /// - `force = true`：同步写入
    /// - `force = false`：dirty 且距上次写入超过最小间隔时，在阻塞线程池中写入
    pub fn persist_snapshot(self: &Arc<Self>, force: bool) {
        if self.persister.closed.load(Ordering::SeqCst) {
            return;
        }

        let generation = self.persister.generation.load(Ordering::SeqCst);
        if force {
            self.write_snapshot(generation);
            return;
        }

        if !self.persister.dirty.load(Ordering::SeqCst) {
            return;
        }
        let due = self
            .persister
            .last_persist
            .lock()
            .map_or(true, |t| t.elapsed() >= self.persister.min_interval);
        if !due {
            return;
        }
        if self
            .persister
            .flush_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match &self.runtime {
            Some(handle) => {
                let job = Arc::clone(self);
                handle.spawn_blocking(move || {
                    job.write_snapshot(generation);
                    job.persister.flush_scheduled.store(false, Ordering::SeqCst);
                });
            }
            None => {
                self.write_snapshot(generation);
                self.persister.flush_scheduled.store(false, Ordering::SeqCst);
            }
        }
    }

    /// 在阻塞线程池中强制写入快照并等待完成
    pub async fn flush_snapshot(self: &Arc<Self>) {
        let job = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || job.persist_snapshot(true)).await {
            warn!("快照写入线程异常退出: app_id={}, 错误: {}", self.app_id, e);
        }
    }

    fn write_snapshot(&self, generation: u64) {
        let _guard = self.persister.write_lock.lock();
        if self.persister.closed.load(Ordering::SeqCst)
            || self.persister.generation.load(Ordering::SeqCst) != generation
        {
            return;
        }

        self.persister.dirty.store(false, Ordering::SeqCst);
        let snapshot = self.current_snapshot();
        if let Err(e) = save_snapshot(&self.app_dir, &snapshot) {
            warn!("保存续传快照失败: app_id={}, 错误: {}", self.app_id, e);
            self.persister.dirty.store(true, Ordering::SeqCst);
        }
        *self.persister.last_persist.lock() = Some(Instant::now());
    }

    /// 写入失败现场快照
    pub fn persist_failed_snapshot(&self) {
        let _guard = self.persister.write_lock.lock();
        if let Err(e) = save_failed_snapshot(&self.app_dir, &self.current_snapshot()) {
            warn!("保存失败快照失败: app_id={}, 错误: {}", self.app_id, e);
        }
    }

    /// 同步清除快照并停止后续写入
    pub fn clear_snapshot(&self) {
        let _guard = self.persister.write_lock.lock();
        self.persister.closed.store(true, Ordering::SeqCst);
        self.persister.generation.fetch_add(1, Ordering::SeqCst);
        self.persister.dirty.store(false, Ordering::SeqCst);
        delete_snapshot(&self.app_dir);
    }
}
