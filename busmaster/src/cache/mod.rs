//! Cache coherency management.
//!
//! Makes the CPU's and the device's view of a DMA buffer agree, using the
//! cheapest mechanism the platform offers. The tier is chosen once; only the
//! coalescing counters change per transfer.
//!
//! # Direction rules
//!
//! ```text
//!   sync_for_device  after CPU writes, before device reads    write back
//!   sync_for_cpu     after device writes, before CPU reads    invalidate
//! ```
//!
//! Invalidation only ever follows the device write. Before a device write
//! the manager writes dirty lines back (CLFLUSH writes back before it
//! invalidates) but never drops them.
//!
//! # Coalescing
//!
//! A global write-back-invalidate costs the same for one buffer as for a
//! hundred. Deferred requests bump a counter and arm a deadline on the first
//! deferral; one global flush pays for all of them once the counter reaches
//! the threshold, the deadline passes, or someone forces it.

pub mod ops;
pub mod tier;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dma_pool::align_down;
use spin::Mutex;

use crate::dma::Direction;
use crate::platform::ExecutionMode;
use crate::time::{Clock, Timeout};

pub use ops::{CacheOps, HardwareCacheOps};
pub use tier::{select_tier, CacheTier, CpuCaps};

/// Deferred flushes that trigger a global flush.
pub const DEFAULT_FLUSH_THRESHOLD: u32 = 8;
pub const MAX_FLUSH_THRESHOLD: u32 = 32;

/// Longest a deferred flush may wait, in milliseconds.
pub const DEFAULT_MAX_FLUSH_DELAY_MS: u32 = 50;
pub const MAX_FLUSH_DELAY_MS: u32 = 1000;

/// Coherency setup, probed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherencyConfig {
    pub tier: CacheTier,
    pub line_size: usize,
    pub coalescing: bool,
    pub flush_threshold: u32,
    pub max_flush_delay_ms: u32,
    /// Global write-back-invalidate may execute in this mode.
    pub global_flush_permitted: bool,
}

impl CoherencyConfig {
    /// Configuration for the detected CPU and mode.
    pub fn probe(caps: &CpuCaps, mode: ExecutionMode) -> Self {
        let tier = select_tier(caps, mode);
        Self {
            tier,
            line_size: caps.line_size,
            coalescing: tier == CacheTier::GlobalWritebackInvalidate,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            max_flush_delay_ms: DEFAULT_MAX_FLUSH_DELAY_MS,
            global_flush_permitted: caps.wbinvd && mode.permits_global_flush(),
        }
    }

    /// Override the probed tier.
    pub fn with_tier(mut self, tier: CacheTier) -> Self {
        self.tier = tier;
        self
    }

    /// Set coalescing, clamping threshold to 1..=32 and delay to 1..=1000 ms.
    pub fn with_coalescing(mut self, enabled: bool, threshold: u32, max_delay_ms: u32) -> Self {
        self.coalescing = enabled;
        self.flush_threshold = threshold.clamp(1, MAX_FLUSH_THRESHOLD);
        self.max_flush_delay_ms = max_delay_ms.clamp(1, MAX_FLUSH_DELAY_MS);
        self
    }
}

/// Counters, as returned by [`CoherencyManager::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoherencyStats {
    pub tx_syncs: u32,
    pub rx_syncs: u32,
    pub line_flushes: u32,
    pub global_flushes: u32,
    pub software_touches: u32,
    pub deferred: u32,
    /// Deferred requests satisfied by a shared global flush.
    pub coalesced: u32,
    pub forced: u32,
    /// Global flushes refused because the mode forbids them.
    pub blocked: u32,
}

#[derive(Default)]
struct Counters {
    tx_syncs: AtomicU32,
    rx_syncs: AtomicU32,
    line_flushes: AtomicU32,
    global_flushes: AtomicU32,
    software_touches: AtomicU32,
    deferred: AtomicU32,
    coalesced: AtomicU32,
    forced: AtomicU32,
    blocked: AtomicU32,
}

fn bump(counter: &AtomicU32, n: u32) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[derive(Default)]
struct PendingFlush {
    count: u32,
    deadline: Option<Timeout>,
}

/// Direction-aware cache maintenance for one subsystem context.
pub struct CoherencyManager<O, C> {
    ops: O,
    clock: C,
    config: CoherencyConfig,
    pending: Mutex<PendingFlush>,
    counters: Counters,
    warned_blocked: AtomicBool,
}

impl<O: CacheOps, C: Clock> CoherencyManager<O, C> {
    pub fn new(config: CoherencyConfig, ops: O, clock: C) -> Self {
        log::info!(
            "cache: tier {:?}, {} byte lines, coalescing {} (threshold {}, max delay {} ms)",
            config.tier,
            config.line_size,
            if config.coalescing { "on" } else { "off" },
            config.flush_threshold,
            config.max_flush_delay_ms
        );
        Self {
            ops,
            clock,
            config,
            pending: Mutex::new(PendingFlush::default()),
            counters: Counters::default(),
            warned_blocked: AtomicBool::new(false),
        }
    }

    pub fn tier(&self) -> CacheTier {
        self.config.tier
    }

    pub fn config(&self) -> &CoherencyConfig {
        &self.config
    }

    pub fn line_size(&self) -> usize {
        self.config.line_size
    }

    /// Prepare `len` bytes at `ptr` for a device access.
    ///
    /// # Safety
    /// `ptr..ptr + len` must be valid memory owned by the caller.
    pub unsafe fn sync_for_device(&self, ptr: *mut u8, len: usize, direction: Direction) {
        if len == 0 || self.config.tier == CacheTier::Disabled {
            return;
        }
        if !direction.device_reads() {
            // Device is about to write: get dirty lines out of its way.
            match self.config.tier {
                CacheTier::PerLineFlush => {
                    self.flush_lines(ptr, len);
                    self.ops.fence();
                }
                _ => {
                    self.force_flush();
                }
            }
            return;
        }

        bump(&self.counters.tx_syncs, 1);
        match self.config.tier {
            CacheTier::PerLineFlush => {
                self.flush_lines(ptr, len);
                self.ops.fence();
            }
            CacheTier::GlobalWritebackInvalidate => {
                self.flush_now();
            }
            CacheTier::SoftwarePattern => {
                self.touch_lines(ptr, len, true);
                self.ops.fence();
            }
            CacheTier::Disabled => {}
        }
    }

    /// Like [`sync_for_device`](Self::sync_for_device), but on the global
    /// tier with coalescing on the flush is only queued.
    ///
    /// The caller must [`force_flush`](Self::force_flush) before the device
    /// is told to read.
    ///
    /// # Safety
    /// As for `sync_for_device`.
    pub unsafe fn sync_for_device_deferred(&self, ptr: *mut u8, len: usize, direction: Direction) {
        let coalescible = self.config.tier == CacheTier::GlobalWritebackInvalidate
            && self.config.coalescing
            && direction.device_reads();
        if coalescible && len > 0 {
            bump(&self.counters.tx_syncs, 1);
            self.defer_flush();
        } else {
            self.sync_for_device(ptr, len, direction);
        }
    }

    /// Make device-written data at `ptr` visible to the CPU.
    ///
    /// # Safety
    /// `ptr..ptr + len` must be valid memory owned by the caller.
    pub unsafe fn sync_for_cpu(&self, ptr: *mut u8, len: usize, direction: Direction) {
        if len == 0 || self.config.tier == CacheTier::Disabled || !direction.device_writes() {
            return;
        }
        bump(&self.counters.rx_syncs, 1);
        match self.config.tier {
            CacheTier::PerLineFlush => {
                self.ops.fence();
                self.flush_lines(ptr, len);
                self.ops.fence();
            }
            CacheTier::GlobalWritebackInvalidate => {
                self.flush_now();
            }
            CacheTier::SoftwarePattern => {
                self.ops.fence();
                // Read-only: writing back here would clobber the device's data.
                self.touch_lines(ptr, len, false);
            }
            CacheTier::Disabled => {}
        }
    }

    /// Queue one global flush request. Returns `true` if this call flushed.
    pub fn defer_flush(&self) -> bool {
        if !self.config.coalescing {
            return self.flush_now();
        }
        let due = {
            let mut pending = self.pending.lock();
            if pending.count == 0 {
                pending.deadline = Some(Timeout::after_ms(
                    &self.clock,
                    u64::from(self.config.max_flush_delay_ms),
                ));
            }
            pending.count += 1;
            bump(&self.counters.deferred, 1);
            pending.count >= self.config.flush_threshold
                || pending.deadline.is_some_and(|d| d.expired(&self.clock))
        };
        if due {
            self.flush_coalesced()
        } else {
            false
        }
    }

    /// Flush if queued requests have waited past the max delay.
    pub fn flush_if_due(&self) -> bool {
        let due = {
            let pending = self.pending.lock();
            pending.count > 0 && pending.deadline.is_some_and(|d| d.expired(&self.clock))
        };
        due && self.flush_coalesced()
    }

    /// Flush now if anything is queued.
    pub fn force_flush(&self) -> bool {
        if self.pending() == 0 {
            return false;
        }
        bump(&self.counters.forced, 1);
        self.flush_coalesced()
    }

    /// Queued flush requests.
    pub fn pending(&self) -> u32 {
        self.pending.lock().count
    }

    /// Write a pattern through `scratch`, sync both ways, and check it
    /// survived.
    pub fn self_test(&self, scratch: &mut [u8]) -> bool {
        for (i, b) in scratch.iter_mut().enumerate() {
            *b = (i as u8) ^ 0xA5;
        }
        // SAFETY: `scratch` is a live exclusive slice.
        unsafe {
            self.sync_for_device(scratch.as_mut_ptr(), scratch.len(), Direction::Bidirectional);
            self.sync_for_cpu(scratch.as_mut_ptr(), scratch.len(), Direction::Bidirectional);
        }
        let ok = scratch.iter().enumerate().all(|(i, b)| *b == (i as u8) ^ 0xA5);
        if !ok {
            log::error!("cache: coherency self-test failed on tier {:?}", self.config.tier);
        }
        ok
    }

    pub fn stats(&self) -> CoherencyStats {
        let c = &self.counters;
        let load = |a: &AtomicU32| a.load(Ordering::Relaxed);
        CoherencyStats {
            tx_syncs: load(&c.tx_syncs),
            rx_syncs: load(&c.rx_syncs),
            line_flushes: load(&c.line_flushes),
            global_flushes: load(&c.global_flushes),
            software_touches: load(&c.software_touches),
            deferred: load(&c.deferred),
            coalesced: load(&c.coalesced),
            forced: load(&c.forced),
            blocked: load(&c.blocked),
        }
    }

    /// Total sync operations requested.
    pub fn sync_count(&self) -> u32 {
        let s = self.stats();
        s.tx_syncs + s.rx_syncs
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn flush_coalesced(&self) -> bool {
        let satisfied = {
            let mut pending = self.pending.lock();
            let n = pending.count;
            pending.count = 0;
            pending.deadline = None;
            n
        };
        if satisfied == 0 {
            return false;
        }
        let flushed = self.global_flush();
        if flushed {
            bump(&self.counters.coalesced, satisfied);
            log::trace!("cache: one global flush for {} deferred requests", satisfied);
        }
        flushed
    }

    /// Immediate global flush that also satisfies anything queued.
    fn flush_now(&self) -> bool {
        let satisfied = core::mem::take(&mut *self.pending.lock()).count;
        let flushed = self.global_flush();
        if flushed && satisfied > 0 {
            bump(&self.counters.coalesced, satisfied);
        }
        flushed
    }

    fn global_flush(&self) -> bool {
        if !self.config.global_flush_permitted {
            bump(&self.counters.blocked, 1);
            if !self.warned_blocked.swap(true, Ordering::Relaxed) {
                log::warn!("cache: global flush not permitted in this execution mode, skipping");
            }
            return false;
        }
        // SAFETY: permitted by the execution mode check above.
        unsafe { self.ops.write_back_invalidate_all() };
        self.ops.fence();
        bump(&self.counters.global_flushes, 1);
        true
    }

    unsafe fn flush_lines(&self, ptr: *mut u8, len: usize) {
        let line = self.config.line_size.max(1);
        let start = align_down(ptr as usize, line);
        let end = ptr as usize + len;
        let mut lines = 0u32;
        let mut addr = start;
        while addr < end {
            self.ops.flush_line(addr as *const u8);
            lines += 1;
            addr += line;
        }
        bump(&self.counters.line_flushes, lines);
    }

    /// Touch one byte in every line of the buffer, staying inside it.
    unsafe fn touch_lines(&self, ptr: *mut u8, len: usize, write: bool) {
        let line = self.config.line_size.max(1);
        let mut offset = 0;
        while offset < len {
            let p = ptr.add(offset);
            let v = core::ptr::read_volatile(p);
            if write {
                core::ptr::write_volatile(p, v);
            }
            let next_line = align_down(p as usize, line) + line;
            offset = next_line - ptr as usize;
        }
        bump(&self.counters.software_touches, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCacheOps;
    use crate::time::TickClock;

    fn config(tier: CacheTier) -> CoherencyConfig {
        CoherencyConfig {
            tier,
            line_size: 64,
            coalescing: false,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            max_flush_delay_ms: DEFAULT_MAX_FLUSH_DELAY_MS,
            global_flush_permitted: true,
        }
    }

    #[test]
    fn test_coalescing_threshold() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let cfg = config(CacheTier::SoftwarePattern).with_coalescing(true, 4, 50);
        let mgr = CoherencyManager::new(cfg, &ops, &clock);

        assert!(!mgr.defer_flush());
        assert!(!mgr.defer_flush());
        assert!(!mgr.defer_flush());
        assert_eq!(ops.globals(), 0);
        assert_eq!(mgr.pending(), 3);

        assert!(mgr.defer_flush());
        assert_eq!(ops.globals(), 1);
        assert_eq!(mgr.pending(), 0);
        assert_eq!(mgr.stats().coalesced, 4);
    }

    #[test]
    fn test_coalescing_deadline() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let cfg = config(CacheTier::GlobalWritebackInvalidate).with_coalescing(true, 8, 50);
        let mgr = CoherencyManager::new(cfg, &ops, &clock);

        mgr.defer_flush();
        clock.advance_ms(50);
        assert!(!mgr.flush_if_due());
        clock.advance_ms(1);
        assert!(mgr.flush_if_due());
        assert_eq!(ops.globals(), 1);
        assert!(!mgr.flush_if_due());
    }

    #[test]
    fn test_deadline_checked_on_defer() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let cfg = config(CacheTier::GlobalWritebackInvalidate).with_coalescing(true, 32, 10);
        let mgr = CoherencyManager::new(cfg, &ops, &clock);

        mgr.defer_flush();
        clock.advance_ms(11);
        assert!(mgr.defer_flush());
        assert_eq!(ops.globals(), 1);
    }

    #[test]
    fn test_force_flush() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let cfg = config(CacheTier::GlobalWritebackInvalidate).with_coalescing(true, 8, 50);
        let mgr = CoherencyManager::new(cfg, &ops, &clock);

        assert!(!mgr.force_flush());
        mgr.defer_flush();
        mgr.defer_flush();
        assert!(mgr.force_flush());
        assert_eq!(ops.globals(), 1);
        assert_eq!(mgr.stats().forced, 1);
    }

    #[test]
    fn test_clamping() {
        let cfg = config(CacheTier::Disabled).with_coalescing(true, 0, 5000);
        assert_eq!(cfg.flush_threshold, 1);
        assert_eq!(cfg.max_flush_delay_ms, MAX_FLUSH_DELAY_MS);
        let cfg = cfg.with_coalescing(true, 99, 0);
        assert_eq!(cfg.flush_threshold, MAX_FLUSH_THRESHOLD);
        assert_eq!(cfg.max_flush_delay_ms, 1);
    }

    #[test]
    fn test_global_flush_blocked_when_not_permitted() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let mut cfg = config(CacheTier::GlobalWritebackInvalidate);
        cfg.global_flush_permitted = false;
        let mgr = CoherencyManager::new(cfg, &ops, &clock);

        let mut buf = [0u8; 128];
        unsafe { mgr.sync_for_device(buf.as_mut_ptr(), buf.len(), Direction::ToDevice) };
        assert_eq!(ops.globals(), 0);
        assert_eq!(mgr.stats().blocked, 1);
    }

    #[test]
    fn test_per_line_flush_covers_partial_lines() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let mgr = CoherencyManager::new(config(CacheTier::PerLineFlush), &ops, &clock);

        let mut buf = [0u8; 256];
        let base = buf.as_mut_ptr();
        let offset = base.align_offset(64) + 32;
        // 100 bytes starting mid-line touch three lines.
        unsafe { mgr.sync_for_device(base.add(offset), 100, Direction::ToDevice) };
        assert_eq!(ops.lines(), 3);
        unsafe { mgr.sync_for_cpu(base.add(offset), 100, Direction::ToDevice) };
        assert_eq!(ops.lines(), 3, "to-device transfers need no cpu sync");
        unsafe { mgr.sync_for_cpu(base.add(offset), 100, Direction::FromDevice) };
        assert_eq!(ops.lines(), 6);
        assert_eq!(mgr.stats().tx_syncs, 1);
        assert_eq!(mgr.stats().rx_syncs, 1);
    }

    #[test]
    fn test_software_touch_preserves_data() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let mgr = CoherencyManager::new(config(CacheTier::SoftwarePattern), &ops, &clock);
        let mut scratch = [0u8; 300];
        assert!(mgr.self_test(&mut scratch));
        assert_eq!(mgr.stats().software_touches, 2);
        assert_eq!(ops.globals(), 0);
    }

    #[test]
    fn test_disabled_does_nothing() {
        let ops = RecordingCacheOps::default();
        let clock = TickClock::new(1);
        let mgr = CoherencyManager::new(config(CacheTier::Disabled), &ops, &clock);
        let mut buf = [0u8; 64];
        unsafe {
            mgr.sync_for_device(buf.as_mut_ptr(), 64, Direction::Bidirectional);
            mgr.sync_for_cpu(buf.as_mut_ptr(), 64, Direction::Bidirectional);
        }
        assert_eq!(mgr.sync_count(), 0);
        assert_eq!(ops.lines() + ops.globals(), 0);
    }

    #[test]
    fn test_probe_picks_coalescing_for_global_tier() {
        let caps = CpuCaps {
            clflush: false,
            wbinvd: true,
            has_cache: true,
            line_size: 32,
        };
        let cfg = CoherencyConfig::probe(&caps, ExecutionMode::Unvirtualized);
        assert_eq!(cfg.tier, CacheTier::GlobalWritebackInvalidate);
        assert!(cfg.coalescing);
        assert!(cfg.global_flush_permitted);

        let cfg = CoherencyConfig::probe(&caps, ExecutionMode::Virtualized);
        assert_eq!(cfg.tier, CacheTier::SoftwarePattern);
        assert!(!cfg.global_flush_permitted);
    }
}
