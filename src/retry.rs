use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// In-process retry budget for a single external call. The delay doubles per
/// attempt and is capped, matching the run queue's backoff law.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
        doubled.min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy is exhausted, sleeping between
/// attempts. Returns the last error when giving up.
pub async fn retry_async<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    ?err,
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "call failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
