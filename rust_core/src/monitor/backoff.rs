//! Exponential backoff with jitter for stream reconnects.

use std::time::Duration;

/// Reconnect delay policy: exponential growth from a base delay, capped
/// at a maximum, with ±jitter to avoid synchronized reconnect storms.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Jitter fraction (0.1 = ±10%)
    pub jitter_pct: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter_pct: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_pct: 0.1,
        }
    }

    /// Delay for the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let exponential_ms = base_ms * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        let capped_ms = exponential_ms.min(self.max.as_millis() as f64);

        let jitter_range = capped_ms * self.jitter_pct;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped_ms + jitter).max(0.0);

        Duration::from_millis(final_ms as u64)
    }
}
