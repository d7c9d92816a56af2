//! Hardware descriptor rings, as the completion path sees them.
//!
//! Hardware descriptors hold bus addresses, not Rust values, so the mapping
//! behind each in-flight descriptor lives in a side table indexed by
//! descriptor number. The interrupt handler and the bottom half both reach
//! into that table; every slot moves through an atomic state so exactly one
//! of them gets each mapping.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::dma::Mapping;

/// Ring state needed to hand mappings back.
pub trait DescriptorRing {
    fn descriptor_count(&self) -> usize;

    /// The device has finished with descriptor `index`.
    fn is_hw_complete(&self, index: usize) -> bool;

    /// Detach the mapping behind `index`, if one is still attached.
    fn take_mapping(&self, index: usize) -> Option<Mapping>;

    /// Attach `mapping` to `index`. Gives it back if the slot is occupied.
    fn attach_mapping(&self, index: usize, mapping: Mapping) -> Result<(), Mapping>;
}

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const HELD: u8 = 2;

struct Slot {
    state: AtomicU8,
    mapping: UnsafeCell<Option<Mapping>>,
}

/// Mappings attached to `N` descriptors.
pub struct MappingTable<const N: usize> {
    slots: [Slot; N],
}

// SAFETY: a slot's mapping is only touched by whoever moved its state to
// BUSY, and only until it moves it out again.
unsafe impl<const N: usize> Sync for MappingTable<N> {}

impl<const N: usize> MappingTable<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                state: AtomicU8::new(EMPTY),
                mapping: UnsafeCell::new(None),
            }),
        }
    }

    /// Attach `mapping` to descriptor `index`.
    pub fn attach(&self, index: usize, mapping: Mapping) -> Result<(), Mapping> {
        let Some(slot) = self.slots.get(index) else {
            return Err(mapping);
        };
        if slot
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(mapping);
        }
        // SAFETY: BUSY gives us the slot.
        unsafe { *slot.mapping.get() = Some(mapping) };
        slot.state.store(HELD, Ordering::Release);
        Ok(())
    }

    /// Detach the mapping from descriptor `index`.
    pub fn take(&self, index: usize) -> Option<Mapping> {
        let slot = self.slots.get(index)?;
        slot.state
            .compare_exchange(HELD, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        // SAFETY: as in `attach`.
        let mapping = unsafe { (*slot.mapping.get()).take() };
        slot.state.store(EMPTY, Ordering::Release);
        mapping
    }

    pub fn is_attached(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| s.state.load(Ordering::Acquire) == HELD)
    }

    /// Descriptors with a mapping attached.
    pub fn attached(&self) -> usize {
        (0..N).filter(|&i| self.is_attached(i)).count()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for MappingTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{MapFlags, Unmap};
    use crate::testing::direct_mapper;

    #[test]
    fn test_attach_take() {
        let (mut dma, mut buffers) = direct_mapper(2, 64);
        let pci = dma.registry().lookup("pci-busmaster").unwrap();
        let table = MappingTable::<4>::new();

        let a = dma.map_tx(pci, buffers.pop().unwrap(), 64, MapFlags::empty()).unwrap();
        let b = dma.map_tx(pci, buffers.pop().unwrap(), 64, MapFlags::empty()).unwrap();
        table.attach(1, a).unwrap();
        let b = table.attach(1, b).unwrap_err();
        let b = table.attach(9, b).unwrap_err();
        assert!(table.is_attached(1));
        assert_eq!(table.attached(), 1);

        let a = table.take(1).unwrap();
        assert!(table.take(1).is_none());
        assert!(table.take(9).is_none());
        assert_eq!(table.attached(), 0);

        let _ = dma.unmap(a);
        let _ = dma.unmap(b);
    }
}
