use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Fixed-base policy without jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// Never exceeds `max`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(62) as i32;
        let max_ms = self.max.as_millis() as f64;
        let delay = (self.base.as_millis() as f64 * 2.0_f64.powi(exponent)).min(max_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let spread = delay * jitter;
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };

        Duration::from_millis(delay.clamp(0.0, max_ms) as u64)
    }
}
