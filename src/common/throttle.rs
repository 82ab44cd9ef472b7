//! 事件节流器
//!
//! 控制进度事件的发布频率，避免事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 时间戳以创建时刻为原点保存在原子变量中，多线程调用无需加锁
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次发布距原点的纳秒数，`u64::MAX` 表示从未发布
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(u64::MAX),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否应该发布
    ///
    /// 距上次发布超过间隔时返回 true 并更新时间戳；并发调用中只有一个成功
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != u64::MAX && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（终态事件）
    pub fn force_emit(&self) {
        self.last_emit_nanos.store(self.elapsed_nanos(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(u64::MAX, Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        (self.origin.elapsed().as_nanos() as u64).min(u64::MAX - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
