//! Exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Doubling delay schedule capped at `max_delay`.
///
/// `delay(n) = min(base_delay * 2^(n-1), max_delay)` for `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    /// Create a schedule
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// The first `attempts` delays.
    pub fn delays(&self, attempts: u32) -> impl Iterator<Item = Duration> + '_ {
        (1..=attempts).map(move |attempt| self.delay(attempt))
    }
}
