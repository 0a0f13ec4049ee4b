// Time source for health polling and subprocess timeouts
use std::time::{Duration, Instant};

/// Abstracts time so poll loops can be driven without real sleeps in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A point in time after which a poll loop gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            started: clock.now(),
            budget,
        }
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now().duration_since(self.started) >= self.budget
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.budget
            .saturating_sub(clock.now().duration_since(self.started))
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}
