//! Backoff for transient provider failures and re-runs for write conflicts.

use std::future::Future;
use std::time::Duration;

use crate::config::StateProviderSection;
use crate::errors::{StateError, StateResult};

/// Attempts made by [`retry_conflicts`] before the conflict is surfaced.
pub const CONFLICT_ATTEMPTS: u32 = 5;

const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(section: &StateProviderSection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.retry_base_ms),
            max_delay: MAX_DELAY,
        }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying `ProviderUnavailable` with exponential backoff.
///
/// Every other error, `RateLimited` included, is returned immediately.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> StateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StateResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Re-run a read-modify-write operation while it loses optimistic-concurrency races.
pub async fn retry_conflicts<T, F, Fut>(what: &str, mut op: F) -> StateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StateResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e @ StateError::ConcurrentModification { .. }) if attempt < CONFLICT_ATTEMPTS => {
                tracing::debug!(operation = what, attempt, error = %e, "write conflict, re-reading");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
