//! Exponential reconnect backoff.
//!
//! Delay for the n-th consecutive failure is `min(base * 2^n, cap)`. The
//! counter resets after a successful connection.

use std::time::Duration;

use super::config::RetryPolicy;

/// Per-server backoff counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            failures: 0,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.base_delay, policy.max_delay)
    }

    /// Delay for a given number of prior failures, without mutating state.
    pub fn delay_for(&self, failures: u32) -> Duration {
        // 2^31 already overflows any sane base; clamp the shift.
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
