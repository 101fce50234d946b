use std::future::Future;
use std::time::Duration;
use tokio_retry::Retry;
use tracing::warn;

use crate::config::ScraperConfig;

/// Bounded exponential backoff: wait `base_delay * 2^i` after failed attempt `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }

    /// Delays between attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let base = self.base_delay;
        (0..self.max_attempts.saturating_sub(1)).map(move |i| base.saturating_mul(1u32 << i.min(31)))
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
/// The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    Retry::start(policy.delays(), || {
        attempt += 1;
        let n = attempt;
        let fut = operation();
        async move {
            fut.await.inspect_err(|e| {
                warn!(attempt = n, max_attempts = policy.max_attempts, error = %e, "{} failed", label);
            })
        }
    })
    .await
}
