use std::future::Future;
use std::time::Duration;

use rand_core::{OsRng, RngCore};

use crate::errors::{GraphError, GraphResult};

/// Bounded retry with randomized exponential backoff for store contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): a random point in the
    /// upper half of the capped exponential window.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let window = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);

        let window_ms = window.as_millis() as u64;
        if window_ms == 0 {
            return window;
        }
        let half = window_ms / 2;
        let jitter = OsRng.next_u64() % (window_ms - half + 1);
        Duration::from_millis(half + jitter)
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. Exhausted contention escalates to `InternalStore`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> GraphResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GraphResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        operation = %operation,
                        attempts = attempt,
                        error = %err,
                        "store contention persisted, giving up"
                    );
                    return Err(GraphError::internal(format!(
                        "{operation} failed after {attempt} attempts: {err}"
                    )));
                }

                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation = %operation,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
