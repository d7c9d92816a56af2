//! DMA region abstraction.
//!
//! A region pairs a CPU pointer with the bus address the device sees for the
//! same bytes. Bounce pools carve their entries out of one.

use crate::addr::PhysAddr;

/// DMA-capable memory region.
///
/// Contains both CPU-accessible pointer and device-visible bus address.
#[derive(Clone, Copy)]
pub struct DmaRegion {
    cpu_ptr: *mut u8,
    bus_addr: PhysAddr,
    size: usize,
}

impl DmaRegion {
    /// Create a new DMA region.
    ///
    /// # Safety
    /// - `cpu_ptr` must point to `size` bytes of valid, writable memory that
    ///   outlives every pool carved from this region
    /// - `bus_addr` must be the corresponding device-visible address, and the
    ///   bytes must be physically contiguous and never paged out
    pub const unsafe fn new(cpu_ptr: *mut u8, bus_addr: PhysAddr, size: usize) -> Self {
        Self {
            cpu_ptr,
            bus_addr,
            size,
        }
    }

    /// CPU base pointer.
    #[inline]
    pub const fn cpu_base(&self) -> *mut u8 {
        self.cpu_ptr
    }

    /// Bus base address (what devices see).
    #[inline]
    pub const fn bus_base(&self) -> PhysAddr {
        self.bus_addr
    }

    /// Total size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Get CPU pointer at offset.
    ///
    /// # Safety
    /// Offset must be within region bounds.
    #[inline]
    pub unsafe fn cpu_at(&self, offset: usize) -> *mut u8 {
        self.cpu_ptr.add(offset)
    }

    /// Get bus address at offset, `None` if it overflows.
    #[inline]
    pub const fn bus_at(&self, offset: usize) -> Option<PhysAddr> {
        self.bus_addr.checked_add(offset as u64)
    }

    /// True when `offset..offset + len` lies inside the region.
    #[inline]
    pub const fn contains(&self, offset: usize, len: usize) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.size,
            None => false,
        }
    }

    /// Check if region is valid (non-null, non-empty, bus range representable).
    pub fn is_valid(&self) -> bool {
        !self.cpu_ptr.is_null() && self.size > 0 && self.bus_addr.checked_last(self.size).is_some()
    }
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.cpu_ptr)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_bounds() {
        let mut backing = [0u8; 64];
        let region = unsafe { DmaRegion::new(backing.as_mut_ptr(), PhysAddr::new(0x1000), 64) };
        assert!(region.is_valid());
        assert!(region.contains(0, 64));
        assert!(region.contains(60, 4));
        assert!(!region.contains(60, 5));
        assert!(!region.contains(usize::MAX, 2));
        assert_eq!(region.bus_at(0x10), Some(PhysAddr::new(0x1010)));
    }

    #[test]
    fn test_region_invalid() {
        let region = unsafe { DmaRegion::new(core::ptr::null_mut(), PhysAddr::new(0), 64) };
        assert!(!region.is_valid());

        let mut backing = [0u8; 8];
        let wraps = unsafe { DmaRegion::new(backing.as_mut_ptr(), PhysAddr::new(u64::MAX - 2), 8) };
        assert!(!wraps.is_valid());
    }
}
