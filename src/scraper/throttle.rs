use crate::config::ThrottleConfig;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Request pacing: per-request jitter plus a longer pause every batch.
#[derive(Debug, Clone)]
pub struct Throttle {
    jitter_min_ms: u64,
    jitter_max_ms: u64,
    batch_size: usize,
    batch_pause: Duration,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Self {
        let (lo, hi) = if config.jitter_min_ms <= config.jitter_max_ms {
            (config.jitter_min_ms, config.jitter_max_ms)
        } else {
            (config.jitter_max_ms, config.jitter_min_ms)
        };
        Self {
            jitter_min_ms: lo,
            jitter_max_ms: hi,
            batch_size: config.batch_size,
            batch_pause: Duration::from_millis(config.batch_pause_ms),
        }
    }

    /// No delays at all.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            batch_size: 0,
            batch_pause: Duration::ZERO,
        }
    }

    /// Sleep for a uniform random duration in `[min_ms, max_ms]`.
    pub async fn jitter_delay(min_ms: u64, max_ms: u64) -> Duration {
        let wait = Duration::from_millis(sample_ms(min_ms, max_ms));
        if !wait.is_zero() {
            sleep(wait).await;
        }
        wait
    }

    /// Jitter around a single upstream request.
    pub async fn pace(&self) -> Duration {
        Self::jitter_delay(self.jitter_min_ms, self.jitter_max_ms).await
    }

    /// Long pause after every `batch_size`-th item; `index` is 0-based.
    pub async fn batch_pause(&self, index: usize) -> bool {
        if self.batch_size == 0 || self.batch_pause.is_zero() || (index + 1) % self.batch_size != 0 {
            return false;
        }
        debug!(items = index + 1, pause = ?self.batch_pause, "Batch pause");
        sleep(self.batch_pause).await;
        true
    }
}

fn sample_ms(min_ms: u64, max_ms: u64) -> u64 {
    if max_ms <= min_ms {
        return min_ms;
    }
    rand::random_range(min_ms..=max_ms)
}
