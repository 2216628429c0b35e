//! Reconnect delay policy.
//!
//! Delay for attempt `n` (1-indexed) is `min(base * 2^(n-1), max)`. The
//! attempt counter lives in [`Backoff`] and is reset on every successful
//! connect.

use std::time::Duration;

use crate::constants::defaults;

/// Exponential reconnect backoff with a cap and an optional attempt limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    /// Create a policy with the given bounds. `max_attempts: None` retries
    /// forever.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the given 1-indexed attempt. Attempt 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Record a failed cycle and return the delay before the next try, or
    /// `None` once the attempt limit is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    /// Back to the floor after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of failed cycles since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(defaults::BASE_DELAY, defaults::MAX_DELAY, None)
    }
}
