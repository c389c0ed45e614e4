//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff for retryable failures.
///
/// The attempt ceiling lives in `KernelConfig::max_attempts`; this only decides
/// how long a task waits in `retry_scheduled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 5 * 60 * 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay after `attempts` attempts (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    ///
    /// With base=2s, multiplier=2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}
