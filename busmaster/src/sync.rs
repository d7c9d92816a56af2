//! Synchronization Primitives
//!
//! Interrupt masking and a sequence counter for the completion queue.
//!
//! # Design Notes
//!
//! On a single CPU the only concurrency is interrupt reentrancy. The
//! producer side of the completion queue runs in the interrupt handler and
//! must never wait, so readers that need a consistent view use a sequence
//! counter and retry instead of locking. Masking interrupts is reserved for
//! the rare fallback read and is never held across a copy or cache operation.

use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::asm::core::irq::{disable_interrupts, enable_interrupts, interrupts_enabled};

// ═══════════════════════════════════════════════════════════════════════════
// INTERRUPT GUARD
// ═══════════════════════════════════════════════════════════════════════════

/// Masks interrupts for its lifetime and restores the previous state on drop.
pub struct IrqGuard {
    interrupts_were_enabled: bool,
}

impl IrqGuard {
    /// Save the interrupt flag and disable interrupts.
    #[inline]
    pub fn new() -> Self {
        let interrupts_were_enabled = interrupts_enabled();
        disable_interrupts();
        Self {
            interrupts_were_enabled,
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.interrupts_were_enabled {
            enable_interrupts();
        }
    }
}

/// Run `f` with interrupts masked.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}

// ═══════════════════════════════════════════════════════════════════════════
// SEQUENCE COUNTER
// ═══════════════════════════════════════════════════════════════════════════

/// Writer-preferring sequence counter (the counting half of a seqlock).
///
/// The single writer makes the count odd before touching shared state and
/// even again after publishing it. A reader accepts its snapshot only if it
/// saw the same even count before and after reading.
pub struct SeqCount {
    seq: AtomicU32,
}

impl SeqCount {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    /// Enter a write section (count becomes odd).
    #[inline]
    pub fn write_begin(&self) {
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Leave a write section (count becomes even).
    #[inline]
    pub fn write_end(&self) {
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Start a read. `None` while a write is in progress.
    #[inline]
    pub fn read_begin(&self) -> Option<u32> {
        let seq = self.seq.load(Ordering::Acquire);
        if seq & 1 == 0 {
            Some(seq)
        } else {
            None
        }
    }

    /// True if the data read since `read_begin` returned `start` is consistent.
    #[inline]
    pub fn read_validate(&self, start: u32) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) == start
    }

    /// Current raw count.
    #[inline]
    pub fn current(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqcount_odd_during_write() {
        let seq = SeqCount::new();
        let start = seq.read_begin().unwrap();
        seq.write_begin();
        assert!(seq.read_begin().is_none());
        assert_eq!(seq.current() & 1, 1);
        seq.write_end();
        assert!(!seq.read_validate(start));
        let again = seq.read_begin().unwrap();
        assert!(seq.read_validate(again));
        assert_eq!(again, 2);
    }

    #[test]
    fn test_without_interrupts_returns_value() {
        assert_eq!(without_interrupts(|| 7), 7);
    }
}
