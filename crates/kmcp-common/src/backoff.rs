//! Exponential backoff for reconnect loops
//!
//! Long-lived watches reconnect with a delay that doubles after every
//! failure up to a ceiling, and drops back to the initial delay once a
//! connection succeeds.

use std::time::Duration;

/// Exponential backoff state
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Default for Backoff {
    /// 1s initial delay, doubling, capped at 5 minutes
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }
}

impl Backoff {
    /// Create a backoff with explicit bounds
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the state
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        delay
    }

    /// Return to the initial delay after a success
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay the next call to [`Backoff::next_delay`] would return
    pub fn peek(&self) -> Duration {
        self.current
    }
}
