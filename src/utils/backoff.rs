/// Bounded retry with exponential backoff
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is spent.
///
/// `op` receives the 1-based attempt number. Only recoverable errors are retried;
/// anything else is returned at once. Once the budget is gone the last error is
/// surfaced as [`SyncError::RetriesExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(e) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    code = e.error_code(),
                    "Attempt failed: {}",
                    e
                );

                if attempt >= policy.max_attempts {
                    return Err(SyncError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }

                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}
