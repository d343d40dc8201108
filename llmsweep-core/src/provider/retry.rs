//! Bounded exponential backoff for cloud API calls.

use crate::config::RetryConfig;
use crate::error::{Result, SweepError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `operation` until it succeeds, fails permanently, `cancel` fires, or
/// `config.max_attempts` attempts have been made.
///
/// Only errors for which [`SweepError::is_transient`] holds are retried.
/// Cancellation is observed between attempts, never during one.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    what: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < attempts => {
                let backoff = backoff_delay(config, attempt - 1);
                tracing::warn!(
                    operation = what,
                    attempt,
                    max = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SweepError::api(
                            format!("{what} interrupted after {attempt} attempts: {e}"),
                            false,
                        ));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                if e.is_transient() {
                    return Err(SweepError::api(
                        format!("{what} failed after {attempt} attempts: {e}"),
                        false,
                    ));
                }
                return Err(e);
            }
        }
    }
}

/// Delay before retry number `attempt` (zero-based), capped at the maximum.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    Duration::from_millis(base.min(config.max_backoff_ms as f64) as u64)
}
