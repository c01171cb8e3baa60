//! Client-side retry for `ConcurrencyConflict`.
//!
//! The engine never retries on its own: a busy pool is reported back to the
//! caller, who waits 1s, 2s, then 4s before giving up.

use std::future::Future;
use std::time::Duration;

use crate::engine::EngineError;

/// Retries after the first attempt.
pub const MAX_RETRIES: u32 = 3;

/// Delay before retry number `retry` (1-based): 1s, 2s, 4s, then capped at 4s.
pub fn retry_delay(retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(2);
    Duration::from_secs(1 << exp)
}

/// Run `op`, retrying with [`retry_delay`] while it fails with a retryable
/// error. Any other error, or the last retryable one, is returned as-is.
pub async fn retry_on_conflict<T, F, Fut>(op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    retry_with(op, retry_delay).await
}

async fn retry_with<T, F, Fut>(mut op: F, delay: impl Fn(u32) -> Duration) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && retry < MAX_RETRIES => {
                retry += 1;
                let wait = delay(retry);
                tracing::debug!(retry, ?wait, "retrying after conflict: {e}");
                tokio::time::sleep(wait).await;
            }
            other => return other,
        }
    }
}
