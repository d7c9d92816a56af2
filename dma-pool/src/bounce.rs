//! Fixed-capacity bounce buffer pools.
//!
//! Two independent pools back the fallback path of the mapping layer: the TX
//! pool holds buffers the device reads from, the RX pool holds buffers the
//! device writes into. Entries are carved once from a [`DmaRegion`] and never
//! resized.
//!
//! # Copy direction
//!
//! ```text
//!   to-device:    caller ──copy──▶ bounce      (at acquire)
//!   from-device:  bounce ──copy──▶ caller      (at release, before the entry is freed)
//!   bidirectional: both of the above, TX pool
//! ```
//!
//! Getting this backwards corrupts data without tripping any boundary check,
//! so the direction is fixed in the lease at acquisition and release cannot
//! choose it.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::addr::PhysAddr;
use crate::region::DmaRegion;

/// Maximum number of entries per pool.
pub const MAX_POOL_SIZE: usize = 32;

/// Default number of entries per pool.
pub const DEFAULT_POOL_ENTRIES: usize = 16;

/// Which pool an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Device reads (transmit).
    Tx,
    /// Device writes (receive).
    Rx,
}

/// Pool construction errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool of {0} entries exceeds the maximum of {MAX_POOL_SIZE}")]
    TooManyEntries(usize),
    #[error("bounce entry size must be non-zero")]
    ZeroEntrySize,
    #[error("entry size {size:#x} does not fit inside a {boundary:#x} boundary block")]
    EntryExceedsBoundary { size: usize, boundary: u64 },
    #[error("placement alignment {0:#x} is not a power of two")]
    BadAlignment(u64),
    #[error("placement boundary {0:#x} is not a power of two")]
    BadBoundary(u64),
    #[error("region is not usable for DMA")]
    InvalidRegion,
    #[error("region yielded {carved} of {wanted} compliant {kind:?} entries")]
    RegionTooSmall {
        kind: PoolKind,
        wanted: usize,
        carved: usize,
    },
}

// ============================================================================
// Placement
// ============================================================================

/// Placement rules every carved entry satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Highest byte address an entry may touch.
    pub max_address: u64,
    /// Required start alignment (power of two).
    pub alignment: u64,
    /// Forbidden-crossing block size, 0 for none (power of two).
    pub boundary: u64,
}

impl Placement {
    pub const fn new(max_address: u64, alignment: u64, boundary: u64) -> Self {
        Self {
            max_address,
            alignment,
            boundary,
        }
    }

    /// True when `phys..phys + len` obeys every rule.
    pub fn permits(&self, phys: PhysAddr, len: usize) -> bool {
        let Some(last) = phys.checked_last(len) else {
            return false;
        };
        if last.as_u64() > self.max_address || !phys.is_aligned(self.alignment) {
            return false;
        }
        self.boundary == 0 || phys.block(self.boundary) == last.block(self.boundary)
    }

    fn check(&self, entry_size: usize) -> Result<(), PoolError> {
        if entry_size == 0 {
            return Err(PoolError::ZeroEntrySize);
        }
        if self.alignment > 1 && !self.alignment.is_power_of_two() {
            return Err(PoolError::BadAlignment(self.alignment));
        }
        if self.boundary != 0 {
            if !self.boundary.is_power_of_two() {
                return Err(PoolError::BadBoundary(self.boundary));
            }
            if entry_size as u64 > self.boundary {
                return Err(PoolError::EntryExceedsBoundary {
                    size: entry_size,
                    boundary: self.boundary,
                });
            }
        }
        Ok(())
    }

    /// First compliant start at or after `phys` for an entry of `len` bytes.
    fn place(&self, phys: PhysAddr, len: usize) -> Option<PhysAddr> {
        let mut start = phys.align_up(self.alignment)?;
        if self.boundary != 0 {
            let last = start.checked_last(len)?;
            if start.block(self.boundary) != last.block(self.boundary) {
                // Boundaries are powers of two no smaller than the entry, so
                // the next block start is aligned and holds the whole entry.
                start = start.next_boundary(self.boundary)?.align_up(self.alignment)?;
            }
        }
        Some(start)
    }
}

// ============================================================================
// Entries and leases
// ============================================================================

struct PoolEntry {
    cpu_ptr: *mut u8,
    phys: PhysAddr,
    in_use: AtomicBool,
}

/// Exclusive handle to one acquired bounce entry.
///
/// Not `Clone`: exactly one lease exists per acquired entry, and it must be
/// handed back through [`BouncePools::release`].
#[must_use = "a dropped lease keeps its pool entry busy forever"]
pub struct BounceLease {
    kind: PoolKind,
    index: usize,
    cpu_ptr: *mut u8,
    phys: PhysAddr,
    len: usize,
    copy_back: bool,
}

impl BounceLease {
    /// Pool the entry came from.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Entry index within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pre-validated physical address of the entry.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Bytes of the entry in use by this transfer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CPU pointer to the entry data.
    pub fn as_ptr(&self) -> *mut u8 {
        self.cpu_ptr
    }

    /// True when release copies the entry back to the caller.
    pub fn copies_back(&self) -> bool {
        self.copy_back
    }

    /// Copy caller data into the entry (to-device refresh).
    ///
    /// Copies at most `self.len()` bytes and returns the count.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.len);
        // SAFETY: the lease exclusively owns `len` bytes at `cpu_ptr`, and
        // `src` cannot alias pool memory through a safe reference.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.cpu_ptr, n) };
        n
    }

    /// Copy the entry contents out to caller memory (from-device refresh).
    ///
    /// Copies at most `self.len()` bytes and returns the count.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        // SAFETY: as in `fill`.
        unsafe { core::ptr::copy_nonoverlapping(self.cpu_ptr, dst.as_mut_ptr(), n) };
        n
    }
}

unsafe impl Send for BounceLease {}

impl core::fmt::Debug for BounceLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BounceLease")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("phys", &self.phys)
            .field("len", &self.len)
            .field("copy_back", &self.copy_back)
            .finish()
    }
}

// ============================================================================
// BouncePool
// ============================================================================

/// One fixed-capacity pool of pre-placed entries.
pub struct BouncePool {
    kind: PoolKind,
    entries: [Option<PoolEntry>; MAX_POOL_SIZE],
    total_count: usize,
    entry_size: usize,
    free_count: AtomicUsize,
    exhausted: AtomicU32,
}

impl BouncePool {
    /// Carve `count` entries of `entry_size` bytes from `region`, starting at
    /// byte `offset`.
    ///
    /// Returns the pool and the region offset just past the last entry so a
    /// second pool can be carved from the remainder.
    pub fn carve(
        kind: PoolKind,
        region: &DmaRegion,
        offset: usize,
        entry_size: usize,
        count: usize,
        placement: Placement,
    ) -> Result<(Self, usize), PoolError> {
        if count > MAX_POOL_SIZE {
            return Err(PoolError::TooManyEntries(count));
        }
        if !region.is_valid() {
            return Err(PoolError::InvalidRegion);
        }
        placement.check(entry_size)?;

        let mut entries: [Option<PoolEntry>; MAX_POOL_SIZE] = core::array::from_fn(|_| None);
        let mut cursor = offset;
        let mut carved = 0;

        while carved < count {
            let Some(candidate) = region.bus_at(cursor) else { break };
            let Some(phys) = placement.place(candidate, entry_size) else { break };
            let Some(skip) = phys.offset_from(candidate) else { break };
            let start = cursor + skip as usize;
            if !region.contains(start, entry_size) || !placement.permits(phys, entry_size) {
                // Past the region or past max_address; later slots only go higher.
                break;
            }
            entries[carved] = Some(PoolEntry {
                // SAFETY: `contains` checked above.
                cpu_ptr: unsafe { region.cpu_at(start) },
                phys,
                in_use: AtomicBool::new(false),
            });
            carved += 1;
            cursor = start + entry_size;
        }

        if carved < count {
            log::error!(
                "dma-pool: {:?} pool wanted {} entries of {:#x}, region fits {}",
                kind,
                count,
                entry_size,
                carved
            );
            return Err(PoolError::RegionTooSmall {
                kind,
                wanted: count,
                carved,
            });
        }

        log::debug!(
            "dma-pool: {:?} pool carved {} x {:#x} bytes, region offset {:#x}..{:#x}",
            kind,
            count,
            entry_size,
            offset,
            cursor
        );

        Ok((
            Self {
                kind,
                entries,
                total_count: count,
                entry_size,
                free_count: AtomicUsize::new(count),
                exhausted: AtomicU32::new(0),
            },
            cursor,
        ))
    }

    /// Take a free entry able to hold `len` bytes.
    ///
    /// Linear scan; each entry is claimed with a single compare-exchange on
    /// its in-use flag. Returns `None` when `len` exceeds the entry size or no
    /// entry is free. Never blocks.
    fn acquire(&self, len: usize, copy_back: bool) -> Option<BounceLease> {
        if len == 0 || len > self.entry_size {
            return None;
        }
        for (index, entry) in self.entries[..self.total_count].iter().enumerate() {
            let Some(entry) = entry else { continue };
            if entry
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.free_count.fetch_sub(1, Ordering::AcqRel);
                return Some(BounceLease {
                    kind: self.kind,
                    index,
                    cpu_ptr: entry.cpu_ptr,
                    phys: entry.phys,
                    len,
                    copy_back,
                });
            }
        }
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Mark entry `index` free.
    ///
    /// Returns `false`, and leaves the free count untouched, when the entry
    /// was already free or does not exist.
    pub(crate) fn release_slot(&self, index: usize) -> bool {
        let Some(Some(entry)) = self.entries[..self.total_count].get(index) else {
            return false;
        };
        if entry
            .in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.free_count.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Get number of available (free) entries.
    pub fn available(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Get total number of entries in pool.
    pub fn total(&self) -> usize {
        self.total_count
    }

    /// Get number of entries currently in use.
    pub fn in_use(&self) -> usize {
        self.total_count - self.available()
    }

    /// Size of every entry.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Number of acquisitions that found no free entry.
    pub fn exhaustion_count(&self) -> u32 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Physical placement of every entry (for validation and diagnostics).
    pub fn iter_phys(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.entries[..self.total_count]
            .iter()
            .filter_map(|e| e.as_ref().map(|e| e.phys))
    }
}

unsafe impl Send for BouncePool {}
unsafe impl Sync for BouncePool {}

// ============================================================================
// BouncePools
// ============================================================================

/// The TX and RX pools of one subsystem context.
pub struct BouncePools {
    tx: BouncePool,
    rx: BouncePool,
}

impl BouncePools {
    /// Carve the TX pool, then the RX pool, from one region.
    pub fn new(
        region: &DmaRegion,
        tx_entries: usize,
        rx_entries: usize,
        entry_size: usize,
        placement: Placement,
    ) -> Result<Self, PoolError> {
        let (tx, next) = BouncePool::carve(PoolKind::Tx, region, 0, entry_size, tx_entries, placement)?;
        let (rx, end) = BouncePool::carve(PoolKind::Rx, region, next, entry_size, rx_entries, placement)?;
        log::info!(
            "dma-pool: {} TX + {} RX bounce entries of {:#x} bytes, {:#x} of {:#x} region bytes used",
            tx_entries,
            rx_entries,
            entry_size,
            end,
            region.size()
        );
        Ok(Self { tx, rx })
    }

    /// Take a TX entry and copy `data` into it before the device sees it.
    pub fn acquire_for_device(&self, data: &[u8]) -> Option<BounceLease> {
        let mut lease = self.tx.acquire(data.len(), false)?;
        lease.fill(data);
        Some(lease)
    }

    /// Take an RX entry for a device write of `len` bytes. Release copies it
    /// back.
    pub fn acquire_from_device(&self, len: usize) -> Option<BounceLease> {
        self.rx.acquire(len, true)
    }

    /// Take a TX entry, copy `data` in, and copy back again on release.
    pub fn acquire_bidirectional(&self, data: &[u8]) -> Option<BounceLease> {
        let mut lease = self.tx.acquire(data.len(), true)?;
        lease.fill(data);
        Some(lease)
    }

    /// Return an entry to its pool.
    ///
    /// For from-device leases the entry is copied into `dst` first; the entry
    /// only becomes free after the copy completes.
    pub fn release(&self, lease: BounceLease, dst: &mut [u8]) {
        if lease.copy_back {
            lease.copy_out(dst);
        }
        let released = self.pool(lease.kind).release_slot(lease.index);
        debug_assert!(released, "bounce lease for an entry that was already free");
    }

    pub fn pool(&self, kind: PoolKind) -> &BouncePool {
        match kind {
            PoolKind::Tx => &self.tx,
            PoolKind::Rx => &self.rx,
        }
    }

    /// Every entry of both pools as `(kind, phys)`.
    pub fn entries(&self) -> impl Iterator<Item = (PoolKind, PhysAddr)> + '_ {
        self.tx
            .iter_phys()
            .map(|p| (PoolKind::Tx, p))
            .chain(self.rx.iter_phys().map(|p| (PoolKind::Rx, p)))
    }

    /// Size shared by every entry.
    pub fn entry_size(&self) -> usize {
        self.tx.entry_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_region(size: usize, bus: u64) -> DmaRegion {
        let backing: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
        unsafe { DmaRegion::new(backing.as_mut_ptr(), PhysAddr::new(bus), size) }
    }

    const ISA: Placement = Placement::new(0x00FF_FFFF, 64, 0x1_0000);

    #[test]
    fn test_carve_respects_placement() {
        // Start just below a 64K boundary so carving must skip forward.
        let region = leaked_region(0x4_0000, 0x000F_F800);
        let pools = BouncePools::new(&region, 16, 16, 1536, ISA).unwrap();
        assert_eq!(pools.entries().count(), 32);
        for (_, phys) in pools.entries() {
            assert!(ISA.permits(phys, 1536), "entry at {phys} violates placement");
        }
    }

    #[test]
    fn test_carve_stops_at_max_address() {
        // 32K below the 16M line: TX fits, RX runs out of addressable space.
        let region = leaked_region(0x2_0000, 0x00FF_8000);
        let err = BouncePools::new(&region, 16, 16, 1536, ISA).err().unwrap();
        assert!(matches!(
            err,
            PoolError::RegionTooSmall {
                kind: PoolKind::Rx,
                wanted: 16,
                ..
            }
        ));
    }

    #[test]
    fn test_carve_rejects_bad_config() {
        let region = leaked_region(0x1000, 0x1000);
        assert_eq!(
            BouncePool::carve(PoolKind::Tx, &region, 0, 1536, 33, ISA).err(),
            Some(PoolError::TooManyEntries(33))
        );
        assert_eq!(
            BouncePool::carve(PoolKind::Tx, &region, 0, 0, 1, ISA).err(),
            Some(PoolError::ZeroEntrySize)
        );
        assert_eq!(
            BouncePool::carve(PoolKind::Tx, &region, 0, 0x2_0000, 1, ISA).err(),
            Some(PoolError::EntryExceedsBoundary {
                size: 0x2_0000,
                boundary: 0x1_0000
            })
        );
        let odd = Placement::new(u64::MAX, 24, 0);
        assert_eq!(
            BouncePool::carve(PoolKind::Tx, &region, 0, 16, 1, odd).err(),
            Some(PoolError::BadAlignment(24))
        );
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let region = leaked_region(0x1_0000, 0x10_0000);
        let pools = BouncePools::new(&region, 2, 2, 512, ISA).unwrap();

        let a = pools.acquire_from_device(100).unwrap();
        let b = pools.acquire_from_device(512).unwrap();
        assert!(pools.acquire_from_device(1).is_none());
        assert_eq!(pools.pool(PoolKind::Rx).exhaustion_count(), 1);
        assert_eq!(pools.pool(PoolKind::Tx).available(), 2);
        assert_ne!(a.index(), b.index());

        let mut sink = [0u8; 512];
        pools.release(a, &mut sink);
        assert_eq!(pools.pool(PoolKind::Rx).available(), 1);
        pools.release(b, &mut sink);
        assert_eq!(pools.pool(PoolKind::Rx).in_use(), 0);
    }

    #[test]
    fn test_oversized_request_fails() {
        let region = leaked_region(0x1_0000, 0x10_0000);
        let pools = BouncePools::new(&region, 1, 1, 256, ISA).unwrap();
        assert!(pools.acquire_for_device(&[0u8; 257]).is_none());
        assert!(pools.acquire_from_device(0).is_none());
    }

    #[test]
    fn test_tx_copies_in_at_acquire() {
        let region = leaked_region(0x1_0000, 0x10_0000);
        let pools = BouncePools::new(&region, 1, 1, 256, ISA).unwrap();
        let frame = [0xA5u8; 64];
        let lease = pools.acquire_for_device(&frame).unwrap();
        let seen = unsafe { core::slice::from_raw_parts(lease.as_ptr(), 64) };
        assert_eq!(seen, &frame[..]);

        // TX release never writes to the caller.
        let mut caller = [0u8; 64];
        pools.release(lease, &mut caller);
        assert_eq!(caller, [0u8; 64]);
    }

    #[test]
    fn test_rx_copies_back_at_release() {
        let region = leaked_region(0x1_0000, 0x10_0000);
        let pools = BouncePools::new(&region, 1, 1, 256, ISA).unwrap();
        let lease = pools.acquire_from_device(128).unwrap();
        // Device write.
        unsafe { core::ptr::write_bytes(lease.as_ptr(), 0x3C, 128) };

        let mut caller = [0u8; 128];
        pools.release(lease, &mut caller);
        assert_eq!(caller, [0x3C; 128]);
    }

    #[test]
    fn test_double_release_is_idempotent() {
        let region = leaked_region(0x1_0000, 0x10_0000);
        let pools = BouncePools::new(&region, 1, 4, 256, ISA).unwrap();
        let rx = pools.pool(PoolKind::Rx);

        let lease = pools.acquire_from_device(16).unwrap();
        let index = lease.index();
        assert_eq!(rx.available(), 3);

        assert!(rx.release_slot(index));
        assert!(!rx.release_slot(index));
        assert_eq!(rx.available(), 4);
        assert!(!rx.release_slot(MAX_POOL_SIZE + 1));

        // The lease is stale now; forget it rather than double-release.
        core::mem::forget(lease);
    }
}
