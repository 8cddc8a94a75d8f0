//! Retry delays for failed reconciliation passes.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_JITTER: f64 = 0.1;

pub trait BackoffPolicy: Send + Sync {
    fn next_delay(&mut self) -> Duration;
}

/// Fixed base interval stretched by up to `jitter` of itself, so the delay
/// lies in `[base, base * (1 + jitter)]`.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    base: Duration,
    jitter: f64,
}

impl JitteredBackoff {
    pub fn new(base: Duration, jitter: f64) -> Self {
        Self {
            base,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Upper bound of any delay this policy returns.
    pub fn max_delay(&self) -> Duration {
        self.base.mul_f64(1.0 + self.jitter)
    }
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_JITTER)
    }
}

impl BackoffPolicy for JitteredBackoff {
    fn next_delay(&mut self) -> Duration {
        if self.jitter == 0.0 {
            return self.base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        self.base + self.base.mul_f64(factor)
    }
}
