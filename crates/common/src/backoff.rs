//! Bounded exponential backoff for upstream reconnects.
//!
//! The delay before attempt `n` (zero-based) is `base_delay * 2^n`. Once `max_attempts`
//! reconnects have been tried without a successful open, no further delay is produced and the
//! connection stays down until someone calls `connect()` explicitly.

use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5000);

/// Default number of automatic reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_delay: Duration,
    max_attempts: u32,
    attempt_count: u32,
}

impl ReconnectState {
    pub const fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempt_count: 0,
        }
    }

    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.attempt_count >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt_count).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }

    /// Record that a reconnect attempt is being made.
    pub fn record_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    /// Reset after a successful open.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}
