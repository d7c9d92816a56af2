//! Time and timing module.
//!
//! Everything time-based in the DMA layer (watchdog age, flush deadlines)
//! reads a [`Clock`] in raw ticks and converts milliseconds through the
//! clock's own rate. No hardcoded tick rates.

pub mod timeout;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::asm::core::tsc::read_tsc;

pub use timeout::Timeout;

/// Monotonic tick source.
///
/// `now` is called from interrupt context by the completion queue producer,
/// so implementations must not block.
pub trait Clock {
    /// Current tick count. May wrap; consumers compare with `wrapping_sub`.
    fn now(&self) -> u64;

    /// Ticks per millisecond. Never zero.
    fn ticks_per_ms(&self) -> u64;

    fn ms_to_ticks(&self, ms: u64) -> u64 {
        ms.saturating_mul(self.ticks_per_ms().max(1))
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> u64 {
        (**self).now()
    }

    fn ticks_per_ms(&self) -> u64 {
        (**self).ticks_per_ms()
    }
}

/// TSC-backed clock. Requires an invariant TSC and a calibrated frequency.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    ticks_per_ms: u64,
}

impl TscClock {
    /// `tsc_freq` in Hz, as produced by boot-time calibration.
    pub const fn new(tsc_freq: u64) -> Self {
        let per_ms = tsc_freq / 1000;
        Self {
            ticks_per_ms: if per_ms == 0 { 1 } else { per_ms },
        }
    }
}

impl Clock for TscClock {
    #[inline]
    fn now(&self) -> u64 {
        read_tsc()
    }

    fn ticks_per_ms(&self) -> u64 {
        self.ticks_per_ms
    }
}

/// Clock advanced by a periodic timer interrupt.
///
/// For platforms without a usable TSC: the timer handler calls
/// [`TickClock::advance`] and everyone else reads.
#[derive(Debug)]
pub struct TickClock {
    ticks: AtomicU64,
    ticks_per_ms: u64,
}

impl TickClock {
    pub const fn new(ticks_per_ms: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            ticks_per_ms: if ticks_per_ms == 0 { 1 } else { ticks_per_ms },
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Release);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(self.ms_to_ticks(ms));
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Release);
    }
}

impl Clock for TickClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn ticks_per_ms(&self) -> u64 {
        self.ticks_per_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_clock() {
        let clock = TickClock::new(10);
        assert_eq!(clock.now(), 0);
        clock.advance_ms(5);
        assert_eq!(clock.now(), 50);
        assert_eq!((&clock).now(), 50);
        assert_eq!(clock.ms_to_ticks(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_tsc_clock_rate_never_zero() {
        assert_eq!(TscClock::new(0).ticks_per_ms(), 1);
        assert_eq!(TscClock::new(2_000_000_000).ticks_per_ms(), 2_000_000);
    }
}
