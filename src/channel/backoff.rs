//! backoff.rs
//! Bounded exponential backoff for reconnect loops.
//!
//! Delay doubles per failed attempt from `initial` up to `max`. There is no
//! attempt limit: transport failures are retried for the life of the process.

use std::time::Duration;

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Call after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
