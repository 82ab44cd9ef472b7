//! 进度跟踪
//!
//! 汇总每个 depot 的完成比例与累计字节，得到单一的可观察进度值。
//!
//! ## 设计原则
//!
//! - 有总字节时按字节计算；存在未完成的跟踪 depot 时最多显示 99%
//! - 没有总字节时退化为按 depot 权重加权
//! - depot 完成回调总是把该 depot 置为 1
//! - 监听器通知节流 100ms，0 与 1 两个边界值总是立即通知

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::catalog::DepotId;

/// 监听器 ID
pub type ListenerId = u64;

/// 进度监听器
pub type ProgressListener = Arc<dyn Fn(f32) + Send + Sync>;

/// 监听器通知最小间隔
const LISTENER_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// 速度样本保留时长
const SAMPLE_RETENTION: Duration = Duration::from_secs(120);

/// 瞬时速度窗口
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// ETA 速度窗口
const ETA_WINDOW: Duration = Duration::from_secs(60);

/// ETA 指数平滑系数
const ETA_EMA_ALPHA: f64 = 0.2;

/// 字节进度上限（仍有 depot 未完成时）
const INCOMPLETE_PROGRESS_CAP: f32 = 0.99;

/// 进度跟踪器
pub struct ProgressTracker {
    depot_index: HashMap<DepotId, usize>,
    progresses: Mutex<Vec<f32>>,
    weights: Vec<f32>,
    /// 完成判定所跟踪的 depot（裁剪前选择）
    tracked_depot_ids: BTreeSet<DepotId>,
    completed: Mutex<BTreeSet<DepotId>>,
    total_bytes: AtomicU64,
    bytes_downloaded: AtomicU64,
    last_byte_progress: Mutex<Option<Instant>>,
    /// (时间, 累计字节)
    samples: Mutex<VecDeque<(Instant, u64)>>,
    eta_ema: Mutex<Option<f64>>,
    listeners: RwLock<Vec<(ListenerId, ProgressListener)>>,
    next_listener_id: AtomicU64,
    last_emit: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("bytes_downloaded", &self.bytes_downloaded.load(Ordering::Relaxed))
            .field("total_bytes", &self.total_bytes.load(Ordering::Relaxed))
            .field("completed", &*self.completed.lock())
            .finish()
    }
}

impl ProgressTracker {
    /// 创建进度跟踪器
    ///
    /// # Arguments
    /// * `depot_ids` - 本次工作集 depot（决定权重顺序）
    /// * `depot_sizes` - depot 大小（权重）
    /// * `tracked_depot_ids` - 完成判定跟踪的 depot
    /// * `total_bytes` - 总字节
    pub fn new(
        depot_ids: &[DepotId],
        depot_sizes: &HashMap<DepotId, u64>,
        tracked_depot_ids: impl IntoIterator<Item = DepotId>,
        total_bytes: u64,
    ) -> Self {
        let depot_index = depot_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let weights = depot_ids
            .iter()
            .map(|id| depot_sizes.get(id).copied().unwrap_or(1).max(1) as f32)
            .collect();

        Self {
            depot_index,
            progresses: Mutex::new(vec![0.0; depot_ids.len()]),
            weights,
            tracked_depot_ids: tracked_depot_ids.into_iter().collect(),
            completed: Mutex::new(BTreeSet::new()),
            total_bytes: AtomicU64::new(total_bytes),
            bytes_downloaded: AtomicU64::new(0),
            last_byte_progress: Mutex::new(None),
            samples: Mutex::new(VecDeque::new()),
            eta_ema: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            last_emit: Mutex::new(None),
        }
    }

    // ========================================================================
    // depot 进度
    // ========================================================================

    /// 设置 depot 完成比例（夹在 [0, 1]）
    pub fn set_depot_progress(&self, depot_id: DepotId, fraction: f32) {
        let Some(&index) = self.depot_index.get(&depot_id) else {
            return;
        };
        {
            let mut progresses = self.progresses.lock();
            progresses[index] = fraction.clamp(0.0, 1.0);
        }
        self.emit_progress(false);
    }

    /// 标记 depot 完成，返回是否为新完成
    pub fn mark_depot_completed(&self, depot_id: DepotId) -> bool {
        let newly = self.completed.lock().insert(depot_id);
        if let Some(&index) = self.depot_index.get(&depot_id) {
            self.progresses.lock()[index] = 1.0;
        }
        self.emit_progress(false);
        newly
    }

    /// 用快照恢复已完成集合（不触发通知）
    pub fn initialize_completed(&self, depot_ids: impl IntoIterator<Item = DepotId>) {
        let mut completed = self.completed.lock();
        let mut progresses = self.progresses.lock();
        for id in depot_ids {
            completed.insert(id);
            if let Some(&index) = self.depot_index.get(&id) {
                progresses[index] = 1.0;
            }
        }
    }

    pub fn completed_depot_ids(&self) -> BTreeSet<DepotId> {
        self.completed.lock().clone()
    }

    pub fn is_depot_completed(&self, depot_id: DepotId) -> bool {
        self.completed.lock().contains(&depot_id)
    }

    /// 给定 depot 是否全部完成
    pub fn all_completed<'a>(&self, depot_ids: impl IntoIterator<Item = &'a DepotId>) -> bool {
        let completed = self.completed.lock();
        depot_ids.into_iter().all(|id| completed.contains(id))
    }

    fn has_incomplete_tracked_depots(&self) -> bool {
        let completed = self.completed.lock();
        self.tracked_depot_ids.iter().any(|id| !completed.contains(id))
    }

    // ========================================================================
    // 字节进度
    // ========================================================================

    /// 设置初始已下载字节（续传基线）
    pub fn set_initial_bytes(&self, bytes: u64) {
        self.bytes_downloaded.store(bytes, Ordering::SeqCst);
    }

    /// 累加已下载字节
    pub fn add_bytes(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let total = self.bytes_downloaded.fetch_add(delta, Ordering::SeqCst) + delta;
        let now = Instant::now();
        *self.last_byte_progress.lock() = Some(now);
        self.record_sample(now, total);
        self.emit_progress(false);
    }

    /// 完成时补齐剩余字节
    pub fn settle_bytes(&self) {
        let total = self.total_bytes.load(Ordering::SeqCst);
        self.bytes_downloaded.fetch_max(total, Ordering::SeqCst);
        self.emit_progress(true);
    }

    /// (已下载, 总字节)
    pub fn bytes_progress(&self) -> (u64, u64) {
        (
            self.bytes_downloaded.load(Ordering::SeqCst),
            self.total_bytes.load(Ordering::SeqCst),
        )
    }

    pub fn remaining_bytes(&self) -> u64 {
        let (downloaded, total) = self.bytes_progress();
        total.saturating_sub(downloaded)
    }

    /// 距上次字节增长的时长
    pub fn since_last_byte_progress(&self) -> Option<Duration> {
        self.last_byte_progress.lock().map(|t| t.elapsed())
    }

    /// 整体进度 [0, 1]
    pub fn progress(&self) -> f32 {
        let (downloaded, total) = self.bytes_progress();
        if total > 0 {
            let fraction = (downloaded as f64 / total as f64).min(1.0) as f32;
            if self.has_incomplete_tracked_depots() {
                return fraction.min(INCOMPLETE_PROGRESS_CAP);
            }
            return fraction;
        }

        let weight_sum: f32 = self.weights.iter().sum();
        if weight_sum <= 0.0 {
            return 0.0;
        }
        let progresses = self.progresses.lock();
        let weighted: f32 = progresses
            .iter()
            .zip(self.weights.iter())
            .map(|(p, w)| p * w)
            .sum();
        (weighted / weight_sum).clamp(0.0, 1.0)
    }

    // ========================================================================
    // 速度与 ETA
    // ========================================================================

    fn record_sample(&self, now: Instant, total: u64) {
        let mut samples = self.samples.lock();
        samples.push_back((now, total));
        while let Some((t, _)) = samples.front() {
            if now.duration_since(*t) > SAMPLE_RETENTION {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn speed_over(&self, window: Duration) -> Option<f64> {
        let samples = self.samples.lock();
        let (last_time, last_bytes) = *samples.back()?;
        let (first_time, first_bytes) = samples
            .iter()
            .find(|(t, _)| last_time.duration_since(*t) <= window)
            .copied()?;
        let elapsed = last_time.duration_since(first_time).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(last_bytes.saturating_sub(first_bytes) as f64 / elapsed)
    }

    /// 当前速度（字节/秒）
    pub fn current_speed(&self) -> u64 {
        self.speed_over(SPEED_WINDOW).map_or(0, |s| s as u64)
    }

    /// 预计剩余时间
    pub fn eta(&self) -> Option<Duration> {
        let last_sample = self.samples.lock().back().map(|(t, _)| *t)?;
        if last_sample.elapsed() > SAMPLE_RETENTION {
            return None;
        }
        let speed = self.speed_over(ETA_WINDOW).filter(|s| *s > 0.0)?;
        let raw = self.remaining_bytes() as f64 / speed;

        let mut ema = self.eta_ema.lock();
        let smoothed = match *ema {
            Some(prev) => ETA_EMA_ALPHA * raw + (1.0 - ETA_EMA_ALPHA) * prev,
            None => raw,
        };
        *ema = Some(smoothed);
        Some(Duration::from_secs_f64(smoothed.max(0.0)))
    }

    /// 清空速度历史（重新进入下载阶段时调用）
    pub fn reset_speed_tracking(&self) {
        self.samples.lock().clear();
        *self.eta_ema.lock() = None;
    }

    // ========================================================================
    // 监听器
    // ========================================================================

    pub fn add_listener(&self, listener: ProgressListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    /// 通知监听器
    ///
    /// `force` 为 true 时忽略节流
    pub fn emit_progress(&self, force: bool) {
        let listeners: Vec<ProgressListener> =
            self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        if listeners.is_empty() {
            return;
        }

        let value = self.progress();
        let boundary = value <= 0.0 || value >= 1.0;
        {
            let mut last = self.last_emit.lock();
            let now = Instant::now();
            let due = last.map_or(true, |t| now.duration_since(t) >= LISTENER_EMIT_INTERVAL);
            if !(force || boundary || due) {
                return;
            }
            *last = Some(now);
        }

        for listener in listeners {
            listener(value);
        }
    }
}
