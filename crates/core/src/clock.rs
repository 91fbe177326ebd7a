use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free "last activity" timestamp, safe to touch from the real-time thread.
#[derive(Debug)]
pub struct ActivityClock {
    base: Instant,
    offset_us: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// A clock whose last activity is now.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_us: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Records activity at `at`; never moves the timestamp backwards.
    pub fn touch_at(&self, at: Instant) {
        let offset = at.saturating_duration_since(self.base).as_micros() as u64;
        self.offset_us.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn last(&self) -> Instant {
        self.base + Duration::from_micros(self.offset_us.load(Ordering::Acquire))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last())
    }
}
