//! Timeout and retry policy for calls into external services.

use crate::config::SettlementConfig;
use crate::error::{MarketError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounds `call` by `timeout`; an elapsed timer becomes a `BlockchainError`.
pub async fn with_timeout<T, F>(timeout: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(MarketError::BlockchainError(format!(
            "{what} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Runs `call` under the configured timeout, retrying transient failures with
/// exponential backoff up to `max_retries` times.
///
/// Callers must pass an idempotency key to the remote side: a timed-out
/// attempt may still have been executed.
pub async fn with_retry<T, F, Fut>(config: &SettlementConfig, what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match with_timeout(config.call_timeout(), what, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.backoff(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
