//! 传输回调适配
//!
//! 把传输引擎的回调折叠进 [`DownloadJob`] 的进度、阶段与快照状态。
//!
//! ## 设计原则
//!
//! - 字节增量以引擎全局解压字节计数的高水位差计算，重复或回放的回调不会重复计数
//! - 续传时在第一次真正的下载分片回调之前不计字节（快照已经计过）
//! - 下载中字节仍在流动时，短暂的准备/校验阶段切换被压制
//! - depot 完成回调总是把该 depot 置为完成，与字节增量无关

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::engine::{TransferError, TransferListener, TransferPhase};
use super::events::DownloadEvent;
use super::task::{DownloadJob, DownloadPhase};
use crate::catalog::{AppId, DepotId};
use crate::common::ProgressThrottler;

/// 任务的传输监听器
pub struct JobTransferListener {
    job: Arc<DownloadJob>,
    events: broadcast::Sender<DownloadEvent>,
    progress_throttler: ProgressThrottler,
    flicker_window: Duration,
    /// 已见过的引擎全局解压字节（高水位）
    last_global_bytes: AtomicU64,
    /// 快照字节生效期间不计数
    suppress_accounting: AtomicBool,
}

impl JobTransferListener {
    /// 创建监听器
    ///
    /// # Arguments
    /// * `baseline_bytes` - 快照中已计入、引擎会再次上报的字节
    /// * `suppress_accounting` - 续传任务为 true
    pub fn new(
        job: Arc<DownloadJob>,
        events: broadcast::Sender<DownloadEvent>,
        baseline_bytes: u64,
        suppress_accounting: bool,
        flicker_window: Duration,
        progress_event_interval: Duration,
    ) -> Self {
        Self {
            job,
            events,
            progress_throttler: ProgressThrottler::new(progress_event_interval),
            flicker_window,
            last_global_bytes: AtomicU64::new(baseline_bytes),
            suppress_accounting: AtomicBool::new(suppress_accounting),
        }
    }

    /// 按高水位计算增量
    fn advance_high_water(&self, global_bytes: u64) -> u64 {
        let mut current = self.last_global_bytes.load(Ordering::SeqCst);
        loop {
            if global_bytes <= current {
                return 0;
            }
            match self.last_global_bytes.compare_exchange_weak(
                current,
                global_bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return global_bytes - current,
                Err(actual) => current = actual,
            }
        }
    }

    fn account_bytes(&self, global_bytes: u64) {
        if self.suppress_accounting.load(Ordering::SeqCst) {
            if self.job.phase() == DownloadPhase::Downloading {
                // 首个下载分片只重置基线，本次不计数
                self.last_global_bytes.store(global_bytes, Ordering::SeqCst);
                self.suppress_accounting.store(false, Ordering::SeqCst);
                debug!(
                    "首个下载分片回调，重置字节基线: app_id={}, 基线={}",
                    self.job.app_id(),
                    global_bytes
                );
                return;
            } else {
                // 引擎在准备阶段重新扫描已有数据，只抬高基线
                self.last_global_bytes.fetch_max(global_bytes, Ordering::SeqCst);
                return;
            }
        }

        let delta = self.advance_high_water(global_bytes);
        if delta > 0 {
            self.job.tracker().add_bytes(delta);
            self.job.mark_dirty();
        }
    }

    fn publish_progress(&self, force: bool) {
        if force {
            self.progress_throttler.force_emit();
        } else if !self.progress_throttler.should_emit() {
            return;
        }

        let tracker = self.job.tracker();
        let (downloaded, total) = tracker.bytes_progress();
        let _ = self.events.send(DownloadEvent::Progress {
            app_id: self.job.app_id(),
            downloaded_bytes: downloaded.min(total),
            total_bytes: total,
            speed: tracker.current_speed(),
            progress: tracker.progress(),
            eta_secs: self.job.eta().map(|d| d.as_secs()),
        });
    }

    fn change_phase(&self, phase: DownloadPhase) {
        let old = self.job.phase();
        if old == phase || old.is_terminal() || self.job.is_cancelled() {
            return;
        }

        if old == DownloadPhase::Downloading
            && matches!(phase, DownloadPhase::Preparing | DownloadPhase::Verifying)
        {
            let bytes_flowing = self
                .job
                .tracker()
                .since_last_byte_progress()
                .map_or(false, |elapsed| elapsed < self.flicker_window);
            if bytes_flowing {
                debug!(
                    "压制阶段抖动: app_id={}, {:?} -> {:?}",
                    self.job.app_id(),
                    old,
                    phase
                );
                return;
            }
        }

        self.job.set_phase(phase, None);
        let _ = self.events.send(DownloadEvent::StatusChanged {
            app_id: self.job.app_id(),
            old_phase: old.as_str().to_string(),
            new_phase: phase.as_str().to_string(),
        });
    }
}

impl TransferListener for JobTransferListener {
    fn on_item_added(&self, app_id: AppId) {
        debug!("工作项已入队: job={}, app_id={}", self.job.id(), app_id);
    }

    fn on_download_started(&self, app_id: AppId) {
        info!("开始下载: job={}, app_id={}", self.job.id(), app_id);
        self.change_phase(DownloadPhase::Downloading);
    }

    fn on_phase_changed(&self, phase: TransferPhase) {
        let mapped = match phase {
            TransferPhase::Preparing => DownloadPhase::Preparing,
            TransferPhase::Downloading => DownloadPhase::Downloading,
            TransferPhase::Verifying => DownloadPhase::Verifying,
            TransferPhase::Unknown => return,
        };
        self.change_phase(mapped);
    }

    fn on_item_completed(&self, app_id: AppId) {
        info!("工作项完成: job={}, app_id={}", self.job.id(), app_id);
        if self.job.is_deleting() {
            return;
        }
        for depot_id in self.job.item_depot_ids(app_id) {
            self.job.tracker().mark_depot_completed(*depot_id);
        }
        self.job.mark_dirty();
        self.job.persist_snapshot(true);
        self.publish_progress(false);
    }

    fn on_item_failed(&self, app_id: AppId, error: &TransferError) {
        if error.is_cancellation() {
            if self.job.is_deleting() {
                debug!("删除取消: app_id={}", app_id);
            } else {
                info!("传输被取消，进入暂停: app_id={}", app_id);
                self.job.cancel();
            }
            return;
        }

        error!("工作项失败: job={}, app_id={}, 错误: {}", self.job.id(), app_id, error);
        self.job.fail(&error.to_string());
    }

    fn on_status_message(&self, message: &str) {
        debug!("引擎状态: app_id={}, {}", self.job.app_id(), message);
        self.job.set_status_message(message);
    }

    fn on_chunk_completed(
        &self,
        depot_id: DepotId,
        depot_percent: f32,
        _compressed_bytes: u64,
        uncompressed_bytes: u64,
    ) {
        if self.job.is_deleting() {
            return;
        }
        self.account_bytes(uncompressed_bytes);
        self.job
            .tracker()
            .set_depot_progress(depot_id, depot_percent / 100.0);
        self.job.persist_snapshot(false);
        self.publish_progress(false);
    }

    fn on_depot_completed(&self, depot_id: DepotId, _compressed_bytes: u64, uncompressed_bytes: u64) {
        if self.job.is_deleting() {
            return;
        }
        self.account_bytes(uncompressed_bytes);
        if !self.job.tracker().mark_depot_completed(depot_id) {
            warn!("重复的 depot 完成回调: app_id={}, depot={}", self.job.app_id(), depot_id);
        }
        self.job.mark_dirty();
        self.job.persist_snapshot(true);
        self.publish_progress(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::classify::RequestMode;
    use crate::downloader::plan::{DownloadPlan, OwnerDepots, WorkItem};
    use crate::persistence::{load_snapshot, ResumeSnapshot};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn fresh_plan() -> DownloadPlan {
        DownloadPlan {
            app_id: 100,
            mode: RequestMode::Fresh,
            dlc_app_ids: vec![],
            selected_depot_ids: vec![1, 2],
            pre_snapshot_depot_ids: vec![1, 2],
            depot_sizes: HashMap::from([(1, 500), (2, 300)]),
            work_items: vec![WorkItem {
                app_id: 100,
                depot_ids: vec![1, 2],
            }],
            owners: vec![OwnerDepots {
                app_id: 100,
                depot_ids: vec![1, 2],
                dlc_ids: vec![],
            }],
            snapshot: None,
            total_bytes: 800,
            resumed_bytes: 0,
            completed_depot_bytes: 0,
        }
    }

    fn listener_for(
        plan: &DownloadPlan,
        dir: &TempDir,
        suppress: bool,
    ) -> (Arc<DownloadJob>, JobTransferListener, broadcast::Receiver<DownloadEvent>) {
        let job = Arc::new(DownloadJob::from_plan(
            plan,
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        ));
        let (tx, rx) = broadcast::channel(64);
        let listener = JobTransferListener::new(
            job.clone(),
            tx,
            plan.partial_bytes_already_counted(),
            suppress,
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        (job, listener, rx)
    }

    #[test]
    fn test_replayed_callbacks_not_double_counted() {
        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);
        listener.on_download_started(100);

        listener.on_chunk_completed(1, 20.0, 50, 100);
        listener.on_chunk_completed(1, 20.0, 50, 100);
        listener.on_chunk_completed(1, 10.0, 20, 60);
        listener.on_chunk_completed(1, 40.0, 90, 200);

        assert_eq!(job.tracker().bytes_progress(), (200, 800));
    }

    #[test]
    fn test_depot_completion_independent_of_bytes() {
        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);

        listener.on_depot_completed(2, 0, 0);

        assert!(job.tracker().is_depot_completed(2));
        let snapshot = load_snapshot(temp.path()).unwrap();
        assert!(snapshot.completed_depot_ids.contains(&2));
    }

    #[test]
    fn test_resume_suppresses_until_downloading() {
        let temp = TempDir::new().unwrap();
        let mut plan = fresh_plan();
        plan.mode = RequestMode::Resume;
        plan.selected_depot_ids = vec![2];
        plan.work_items = vec![WorkItem {
            app_id: 100,
            depot_ids: vec![2],
        }];
        plan.snapshot = Some(ResumeSnapshot::new(550, [1]));
        plan.resumed_bytes = 550;
        plan.completed_depot_bytes = 500;

        let (job, listener, _rx) = listener_for(&plan, &temp, true);
        assert_eq!(job.tracker().bytes_progress(), (550, 800));

        // 准备阶段重新扫描已有数据
        listener.on_phase_changed(TransferPhase::Preparing);
        listener.on_chunk_completed(2, 30.0, 80, 90);
        assert_eq!(job.tracker().bytes_progress(), (550, 800));

        listener.on_download_started(100);
        listener.on_chunk_completed(2, 50.0, 100, 150);
        assert_eq!(job.tracker().bytes_progress(), (550, 800));

        listener.on_chunk_completed(2, 60.0, 30, 200);
        assert_eq!(job.tracker().bytes_progress(), (600, 800));
    }

    #[test]
    fn test_resume_rescanned_bytes_not_counted_twice() {
        let temp = TempDir::new().unwrap();
        let mut plan = fresh_plan();
        plan.mode = RequestMode::Resume;
        plan.selected_depot_ids = vec![2];
        plan.work_items = vec![WorkItem {
            app_id: 100,
            depot_ids: vec![2],
        }];
        plan.snapshot = Some(ResumeSnapshot::new(550, [1]));
        plan.resumed_bytes = 550;
        plan.completed_depot_bytes = 500;

        let (job, listener, _rx) = listener_for(&plan, &temp, true);

        // 引擎的全局计数已包含重新扫描的数据
        listener.on_download_started(100);
        listener.on_chunk_completed(2, 10.0, 0, 2000);
        assert_eq!(job.tracker().bytes_progress(), (550, 800));

        listener.on_chunk_completed(2, 20.0, 0, 2100);
        assert_eq!(job.tracker().bytes_progress(), (650, 800));
        assert_eq!(job.current_snapshot().bytes_downloaded, 650);
    }

    #[test]
    fn test_phase_flicker_suppressed_while_bytes_flow() {
        let temp = TempDir::new().unwrap();
        let (job, listener, mut rx) = listener_for(&fresh_plan(), &temp, false);

        listener.on_phase_changed(TransferPhase::Preparing);
        listener.on_download_started(100);
        listener.on_chunk_completed(1, 10.0, 10, 10);
        listener.on_phase_changed(TransferPhase::Verifying);

        assert_eq!(job.phase(), DownloadPhase::Downloading);

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DownloadEvent::StatusChanged { new_phase, .. } = event {
                phases.push(new_phase);
            }
        }
        assert_eq!(phases, vec!["preparing", "downloading"]);
    }

    #[test]
    fn test_verifying_allowed_when_bytes_idle() {
        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);

        listener.on_download_started(100);
        listener.on_phase_changed(TransferPhase::Verifying);

        assert_eq!(job.phase(), DownloadPhase::Verifying);
    }

    #[test]
    fn test_cancellation_pauses_and_failure_fails() {
        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);
        listener.on_item_failed(100, &TransferError::Cancelled);
        assert!(job.is_cancelled());
        assert!(job.failure().is_none());
        assert_eq!(load_snapshot(temp.path()), None);

        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);
        listener.on_item_failed(100, &TransferError::Failed("disk full".into()));
        assert!(job.is_cancelled());
        assert_eq!(job.failure().as_deref(), Some("传输失败: disk full"));
    }

    #[test]
    fn test_item_completed_marks_item_depots() {
        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);

        listener.on_item_completed(100);

        assert!(job.tracker().all_completed([1, 2].iter()));
    }

    #[test]
    fn test_deleting_job_ignores_callbacks() {
        let temp = TempDir::new().unwrap();
        let (job, listener, _rx) = listener_for(&fresh_plan(), &temp, false);
        job.mark_deleting();

        listener.on_chunk_completed(1, 50.0, 100, 250);
        listener.on_depot_completed(1, 100, 500);
        listener.on_item_failed(100, &TransferError::Cancelled);

        assert_eq!(job.tracker().bytes_progress(), (0, 800));
        assert!(load_snapshot(temp.path()).is_none());
        assert!(job.failure().is_none());
    }
}
