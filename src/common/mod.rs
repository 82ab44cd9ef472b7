//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod network_gate;
mod retry;
mod sync_gate;
mod throttle;

pub use network_gate::{ConnectivityEvent, NetworkGate};
pub use retry::{linear_backoff_delay, retry_with_linear_backoff};
pub use sync_gate::{SyncError, SyncGate, SyncGuard};
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
