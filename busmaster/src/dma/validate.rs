//! Boundary and constraint validation.
//!
//! Pure range checks against a [`ConstraintDescriptor`], plus the greedy
//! scatter-gather split. The only state is a set of violation counters kept
//! for diagnostics.
//!
//! # Checks
//!
//! ```text
//!   boundary     addr / b != (addr + len - 1) / b          (b == 0: off)
//!   max address  addr + len - 1 > max_address              (overflow: violation)
//!   alignment    addr % alignment != 0
//!   transfer     len > max_transfer
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use dma_pool::PhysAddr;

use super::segment::{Segment, SegmentList};
use crate::constraints::ConstraintDescriptor;

bitflags! {
    /// Constraint violations found in one range. Empty means usable as is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Violations: u8 {
        const CROSSES_BOUNDARY = 1 << 0;
        const EXCEEDS_MAX_ADDRESS = 1 << 1;
        const MISALIGNED = 1 << 2;
        const EXCEEDS_TRANSFER_SIZE = 1 << 3;
        /// Only produced when re-validating a translated mapping.
        const NOT_CONTIGUOUS = 1 << 4;
    }
}

impl Violations {
    pub fn ok(self) -> bool {
        self.is_empty()
    }
}

/// What to do with a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Usable as one segment.
    Direct,
    /// Usable as these boundary-respecting segments.
    Split(SegmentList),
    /// Needs a bounce buffer.
    Bounce(Violations),
    /// No strategy can carry it.
    Reject(Violations),
}

/// Why a split failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("zero-length range or segment")]
    ZeroLength,
    #[error("range needs more than {max} segments")]
    TooManySegments { max: usize },
    #[error("range runs past the end of the address space")]
    AddressOverflow,
}

// ============================================================================
// Pure checks
// ============================================================================

/// True when `addr..addr + len` spans two `boundary`-sized blocks.
///
/// A zero boundary disables the check; an empty range never crosses. A range
/// that runs off the end of the address space counts as crossing.
pub fn crosses_boundary(addr: PhysAddr, len: usize, boundary: u64) -> bool {
    if boundary == 0 || len == 0 {
        return false;
    }
    match addr.checked_last(len) {
        Some(last) => addr.block(boundary) != last.block(boundary),
        None => true,
    }
}

/// True when the last byte lies above `max_address`, or cannot be computed.
pub fn exceeds_max_address(addr: PhysAddr, len: usize, max_address: u64) -> bool {
    match addr.checked_last(len.max(1)) {
        Some(last) => last.as_u64() > max_address,
        None => true,
    }
}

pub fn is_misaligned(addr: PhysAddr, alignment: u64) -> bool {
    !addr.is_aligned(alignment)
}

/// Check a range against every rule of `c`.
pub fn validate(addr: PhysAddr, len: usize, c: &ConstraintDescriptor) -> Violations {
    let mut v = Violations::empty();
    if crosses_boundary(addr, len, c.boundary) {
        v |= Violations::CROSSES_BOUNDARY;
    }
    if exceeds_max_address(addr, len, c.max_address) {
        v |= Violations::EXCEEDS_MAX_ADDRESS;
    }
    if is_misaligned(addr, c.alignment) {
        v |= Violations::MISALIGNED;
    }
    if len > c.max_transfer {
        v |= Violations::EXCEEDS_TRANSFER_SIZE;
    }
    v
}

/// Greedy split into boundary-respecting segments.
///
/// Each segment runs from the current address to the next boundary, clipped
/// to the remaining length and to `max_segment_size`. More than
/// `max_sg_segments` segments is a failure.
pub fn split(addr: PhysAddr, len: usize, c: &ConstraintDescriptor) -> Result<SegmentList, SplitError> {
    if len == 0 {
        return Err(SplitError::ZeroLength);
    }
    let max = c.max_sg_segments.max(1);
    let mut list = SegmentList::new();
    let mut cursor = addr;
    let mut remaining = len;

    while remaining > 0 {
        let mut seg_len = remaining.min(c.max_segment_size);
        if c.boundary != 0 {
            let next = cursor.next_boundary(c.boundary).ok_or(SplitError::AddressOverflow)?;
            let to_boundary = next.offset_from(cursor).ok_or(SplitError::AddressOverflow)?;
            seg_len = seg_len.min(usize::try_from(to_boundary).unwrap_or(usize::MAX));
        }
        if seg_len == 0 {
            return Err(SplitError::ZeroLength);
        }
        if list.len() == max {
            return Err(SplitError::TooManySegments { max });
        }
        list.push(Segment::new(cursor, seg_len))
            .map_err(|_| SplitError::TooManySegments { max })?;
        remaining -= seg_len;
        if remaining > 0 {
            cursor = cursor
                .checked_add(seg_len as u64)
                .ok_or(SplitError::AddressOverflow)?;
        }
    }
    Ok(list)
}

// ============================================================================
// BoundaryValidator
// ============================================================================

/// Counters of violations seen, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViolationStats {
    pub boundary: u32,
    pub max_address: u32,
    pub alignment: u32,
    pub transfer_size: u32,
    pub contiguity: u32,
    pub splits: u32,
}

impl ViolationStats {
    /// Sum of every violation kind (splits excluded).
    pub fn total(&self) -> u32 {
        self.boundary + self.max_address + self.alignment + self.transfer_size + self.contiguity
    }
}

/// Validator with shared diagnostic counters.
#[derive(Debug, Default)]
pub struct BoundaryValidator {
    boundary: AtomicU32,
    max_address: AtomicU32,
    alignment: AtomicU32,
    transfer_size: AtomicU32,
    contiguity: AtomicU32,
    splits: AtomicU32,
}

impl BoundaryValidator {
    pub const fn new() -> Self {
        Self {
            boundary: AtomicU32::new(0),
            max_address: AtomicU32::new(0),
            alignment: AtomicU32::new(0),
            transfer_size: AtomicU32::new(0),
            contiguity: AtomicU32::new(0),
            splits: AtomicU32::new(0),
        }
    }

    /// [`validate`], counting what it finds.
    pub fn check(&self, addr: PhysAddr, len: usize, c: &ConstraintDescriptor) -> Violations {
        let v = validate(addr, len, c);
        self.record(v);
        v
    }

    /// Count violations found elsewhere (e.g. non-contiguous translations).
    pub fn record(&self, v: Violations) {
        let counters = [
            (Violations::CROSSES_BOUNDARY, &self.boundary),
            (Violations::EXCEEDS_MAX_ADDRESS, &self.max_address),
            (Violations::MISALIGNED, &self.alignment),
            (Violations::EXCEEDS_TRANSFER_SIZE, &self.transfer_size),
            (Violations::NOT_CONTIGUOUS, &self.contiguity),
        ];
        for (flag, counter) in counters {
            if v.contains(flag) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Decide between direct use, a split, and a bounce.
    ///
    /// Only a pure boundary crossing on a scatter-gather device is split;
    /// anything else that fails goes to the bounce path, except oversize
    /// transfers, which nothing can carry.
    pub fn classify(&self, addr: PhysAddr, len: usize, c: &ConstraintDescriptor) -> Classification {
        let v = self.check(addr, len, c);
        if v.ok() {
            return Classification::Direct;
        }
        if v.contains(Violations::EXCEEDS_TRANSFER_SIZE) {
            return Classification::Reject(v);
        }
        if v == Violations::CROSSES_BOUNDARY && c.supports_sg() {
            match split(addr, len, c) {
                Ok(list) => {
                    self.splits.fetch_add(1, Ordering::Relaxed);
                    log::trace!("dma: split {}+{:#x} into {} segments", addr, len, list.len());
                    return Classification::Split(list);
                }
                Err(err) => log::debug!("dma: split of {}+{:#x} failed: {}", addr, len, err),
            }
        }
        Classification::Bounce(v)
    }

    pub fn stats(&self) -> ViolationStats {
        ViolationStats {
            boundary: self.boundary.load(Ordering::Relaxed),
            max_address: self.max_address.load(Ordering::Relaxed),
            alignment: self.alignment.load(Ordering::Relaxed),
            transfer_size: self.transfer_size.load(Ordering::Relaxed),
            contiguity: self.contiguity.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
        }
    }
}
