// ABOUTME: Bounded exponential backoff for fallible async operations
// ABOUTME: Used per record by the sync pipeline and for listener reconnects

use anyhow::Result;
use std::time::Duration;

/// Context attached to an error that will fail the same way on every attempt,
/// such as a key the database cannot cast to the primary-key type.
/// `retry_with_backoff` returns these immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("permanent failure, not retried")]
pub struct Permanent;

/// Whether `Permanent` is attached anywhere in the error's context chain.
pub fn is_permanent(error: &anyhow::Error) -> bool {
    error.downcast_ref::<Permanent>().is_some()
}

/// Retry schedule: up to `max_attempts` tries, sleeping
/// `min(base_delay * 2^attempt, max_delay)` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Schedule for re-establishing the notification connection: never gives up.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// The first attempt runs immediately. On exhaustion, or on an error marked
/// `Permanent`, the last error is returned so the caller can log and count it.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use mirror_sync::retry::{retry_with_backoff, RetryPolicy};
/// # async fn example() -> Result<()> {
/// let value = retry_with_backoff(&RetryPolicy::default(), "ping", || async { Ok(1) }).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt + 1 >= attempts || is_permanent(&e) {
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    label,
                    attempt + 1,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
