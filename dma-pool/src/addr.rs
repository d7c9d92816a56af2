//! Physical address type and alignment helpers.
//!
//! Device-visible addresses are kept apart from CPU pointers by type. All
//! arithmetic that can leave the 64-bit space is checked and returns `None`
//! instead of wrapping.

use core::fmt;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Align a value down to the given power-of-two alignment.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

// ============================================================================
// PhysAddr
// ============================================================================

/// A device-visible physical (bus) address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Address zero.
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// `self + offset`, or `None` on overflow.
    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Address of the last byte of a `len` byte range starting here.
    ///
    /// `None` for an empty range or when the range runs past `u64::MAX`.
    #[inline]
    pub const fn checked_last(self, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        self.checked_add(len as u64 - 1)
    }

    /// Distance in bytes from `base` up to `self`.
    #[inline]
    pub const fn offset_from(self, base: Self) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// True when the address is a multiple of `align`. Alignments of 0 and 1
    /// accept everything.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        align <= 1 || self.0 % align == 0
    }

    /// Round up to a multiple of `align`.
    #[inline]
    pub const fn align_up(self, align: u64) -> Option<Self> {
        if align <= 1 {
            return Some(self);
        }
        let rem = self.0 % align;
        if rem == 0 {
            Some(self)
        } else {
            self.checked_add(align - rem)
        }
    }

    /// Index of the `size`-byte block containing this address.
    #[inline]
    pub const fn block(self, size: u64) -> u64 {
        self.0 / size
    }

    /// First address of the block after the one containing `self`.
    #[inline]
    pub const fn next_boundary(self, size: u64) -> Option<Self> {
        match (self.0 / size).checked_add(1) {
            Some(block) => match block.checked_mul(size) {
                Some(v) => Some(Self(v)),
                None => None,
            },
            None => None,
        }
    }
}

impl From<u64> for PhysAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn test_checked_last() {
        let a = PhysAddr::new(0x1000);
        assert_eq!(a.checked_last(0), None);
        assert_eq!(a.checked_last(1), Some(PhysAddr::new(0x1000)));
        assert_eq!(a.checked_last(0x1000), Some(PhysAddr::new(0x1FFF)));
        assert_eq!(PhysAddr::new(u64::MAX).checked_last(2), None);
    }

    #[test]
    fn test_alignment() {
        let a = PhysAddr::new(0x1004);
        assert!(a.is_aligned(4));
        assert!(!a.is_aligned(8));
        assert!(a.is_aligned(0));
        assert_eq!(a.align_up(16), Some(PhysAddr::new(0x1010)));
        assert_eq!(PhysAddr::new(u64::MAX).align_up(16), None);
    }

    #[test]
    fn test_boundaries() {
        let a = PhysAddr::new(0x1_8000);
        assert_eq!(a.block(0x1_0000), 1);
        assert_eq!(a.next_boundary(0x1_0000), Some(PhysAddr::new(0x2_0000)));
        assert_eq!(PhysAddr::new(u64::MAX).next_boundary(0x1_0000), None);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format!("{}", PhysAddr::new(0xFF)), "0x000000ff");
        assert_eq!(format!("{:?}", PhysAddr::new(0xFF)), "PhysAddr(0xff)");
    }
}
