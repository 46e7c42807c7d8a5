//! Wall clock and sleeping, behind a trait so the loops can be driven in tests.

use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);

    /// Time elapsed since `since`, clamped at zero.
    fn elapsed_since(&self, since: DateTime<Utc>) -> Duration {
        (self.now() - since).to_std().unwrap_or(Duration::ZERO)
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// `max(floor, target - elapsed)`: keeps a cadence close to `target`
/// regardless of how long the work took.
pub fn remaining_pause(target: Duration, elapsed: Duration, floor: Duration) -> Duration {
    target.saturating_sub(elapsed).max(floor)
}
