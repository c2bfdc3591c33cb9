//! Bounded retries for optimistic version conflicts.

use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};

use crate::error::{OrchestrationError, Result};

/// Backoff between attempts after a `ConcurrencyConflict`.
///
/// - Min delay: 5ms
/// - Max delay: 200ms
/// - Jitter enabled
pub fn conflict_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(max_times)
        .with_jitter()
}

/// Runs `op`, re-running it up to `max_times` more times while it fails with a
/// retryable error. Each attempt must re-read whatever it writes.
pub fn retry_on_conflict<T, F>(operation: &'static str, max_times: usize, op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    op.retry(conflict_backoff(max_times))
        .sleep(std::thread::sleep)
        .when(OrchestrationError::is_retryable)
        .notify(|err, delay| {
            tracing::debug!(operation, error = %err, ?delay, "retrying after conflict");
        })
        .call()
}
