//! Bounded polling backoff used by blocking waits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling backoff policy.
///
/// The delay for attempt `n` is `first × factor^n`, clamped to `max`.
/// The base delay is derived only from the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first re-poll.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 1.5,
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep before poll number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Same as [`BackoffPolicy::next`], but never longer than `remaining`.
    pub fn next_within(&self, attempt: u32, remaining: Option<Duration>) -> Duration {
        let delay = self.next(attempt);
        remaining.map_or(delay, |r| delay.min(r))
    }
}
