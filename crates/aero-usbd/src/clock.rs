//! Monotonic time source for scheduling emulated transfer completions.
//!
//! Production code uses [`StdClock`]; tests drive completions deterministically with
//! [`FakeClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic microseconds since an arbitrary origin.
    fn now_us(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Default)]
pub struct FakeClock {
    now_us: AtomicU64,
}

impl FakeClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us),
        }
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        let delta_us = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        self.advance_us(delta_us);
    }

    pub fn advance_us(&self, delta_us: u64) {
        // Saturate rather than wrap: time never runs backwards.
        let _ = self
            .now_us
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(delta_us))
            });
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_and_saturates() {
        let clock = FakeClock::new(10);
        clock.advance(Duration::from_micros(90));
        assert_eq!(clock.now_us(), 100);

        clock.set_us(u64::MAX - 1);
        clock.advance_us(10);
        assert_eq!(clock.now_us(), u64::MAX);
    }

    #[test]
    fn std_clock_is_monotonic() {
        let clock = StdClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
