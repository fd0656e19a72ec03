use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between publish attempts.
///
/// The delay after attempt `n` is `min(initial * multiplier^(n-1), max)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial_ms: u64::try_from(initial.as_millis()).unwrap_or(u64::MAX),
            multiplier,
            max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Retry immediately. Useful in tests.
    pub fn none() -> Self {
        Self {
            initial_ms: 0,
            multiplier: 1.0,
            max_ms: 0,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial_ms == 0 || attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(1_000) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(millis as u64)
    }
}
