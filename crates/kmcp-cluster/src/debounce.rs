//! Resettable single-shot timer

use std::time::Duration;

use tokio::time::Instant;

/// Coalesces bursts of events into one expiry
///
/// Each [`trigger`](Debouncer::trigger) pushes the deadline out to one
/// window from now; the owner awaits [`expired`] on the current deadline
/// and acts once it fires.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    /// Create an idle debouncer with the given quiet window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Quiet window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// (Re)start the timer
    pub fn trigger(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    /// Stop the timer without firing
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Whether a trigger is waiting to fire
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Current deadline, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and report whether the timer had fired by `now`
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Resolve at `deadline`, or never when there is none
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
