//! Tick-based deadlines.
//!
//! All timeouts calculated from the clock's own rate.

use super::Clock;

/// A deadline measured from a start tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    start: u64,
    ticks: u64,
}

impl Timeout {
    pub const fn new(start: u64, ticks: u64) -> Self {
        Self { start, ticks }
    }

    /// Start a `ms` millisecond timeout now.
    pub fn after_ms<C: Clock + ?Sized>(clock: &C, ms: u64) -> Self {
        Self::new(clock.now(), clock.ms_to_ticks(ms))
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Ticks elapsed at `now`, tolerant of counter wrap.
    pub const fn elapsed(&self, now: u64) -> u64 {
        now.wrapping_sub(self.start)
    }

    /// True once strictly more than the timeout has elapsed.
    pub const fn expired_at(&self, now: u64) -> bool {
        self.elapsed(now) > self.ticks
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        self.expired_at(clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TickClock;

    #[test]
    fn test_timeout_expiry() {
        let clock = TickClock::new(1);
        let t = Timeout::after_ms(&clock, 50);
        clock.advance(50);
        assert!(!t.expired(&clock));
        clock.advance(1);
        assert!(t.expired(&clock));
    }

    #[test]
    fn test_timeout_survives_wrap() {
        let t = Timeout::new(u64::MAX - 5, 10);
        assert_eq!(t.elapsed(4), 10);
        assert!(!t.expired_at(4));
        assert!(t.expired_at(5));
    }
}
