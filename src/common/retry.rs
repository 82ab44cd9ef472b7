//! 线性退避重试

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// 计算线性退避延迟
///
/// # 延迟序列（base = 1000ms）
/// - attempt=1: 1000ms
/// - attempt=2: 2000ms
/// - attempt=3: 3000ms
pub fn linear_backoff_delay(attempt: u32, base_delay: Duration) -> Duration {
    base_delay.saturating_mul(attempt.max(1))
}

/// 带线性退避的重试
///
/// 只有 `is_transient` 判定为瞬时的错误才会重试，其余错误立即返回。
///
/// # Arguments
/// * `max_attempts` - 最大尝试次数（至少 1 次）
/// * `base_delay` - 退避基准，第 n 次失败后等待 n × base_delay
/// * `is_transient` - 瞬时错误判定
/// * `operation` - 每次尝试调用一次
pub async fn retry_with_linear_backoff<T, E, F, Fut, P>(
    max_attempts: u32,
    base_delay: Duration,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < max_attempts => {
                let delay = linear_backoff_delay(attempt, base_delay);
                warn!(
                    "操作失败，等待 {}ms 后重试 ({}/{}): {}",
                    delay.as_millis(),
                    attempt,
                    max_attempts,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
