//! Device constraint descriptors and the per-class registry.
//!
//! Each device class the driver supports registers one descriptor under a
//! name before the mapper is built. The mapper takes the registry by value
//! and only reads it afterwards, so descriptors are immutable for the life of
//! every mapping made against them.

use dma_pool::Placement;

use crate::dma::MAX_SEGMENTS;
use crate::error::{DmaError, Result};

/// Maximum number of registered device classes.
pub const MAX_DEVICE_CLASSES: usize = 8;

/// DMA rules of one device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintDescriptor {
    /// Highest physical byte address the device can reach.
    pub max_address: u64,
    /// Required start alignment (power of two, at least 1).
    pub alignment: u64,
    /// Forbidden-crossing block size (power of two), 0 for none.
    pub boundary: u64,
    /// Every transfer must be one physically contiguous run.
    pub requires_contiguous: bool,
    /// Maximum scatter-gather segments; 0 or 1 means no scatter-gather.
    pub max_sg_segments: usize,
    /// Largest length one descriptor segment can express.
    pub max_segment_size: usize,
    /// Largest single transfer.
    pub max_transfer: usize,
    /// Bus snoops CPU caches; no cache maintenance needed.
    pub cache_coherent: bool,
}

impl ConstraintDescriptor {
    /// ISA bus master: 24-bit addressing, no 64K crossing, no scatter-gather.
    pub const ISA_BUS_MASTER: Self = Self {
        max_address: 0x00FF_FFFF,
        alignment: 8,
        boundary: 0x1_0000,
        requires_contiguous: true,
        max_sg_segments: 1,
        max_segment_size: 0xFFFF,
        max_transfer: 0x1_0000,
        cache_coherent: false,
    };

    /// PCI bus master: 32-bit addressing, snooping bus, 8-entry scatter-gather.
    pub const PCI_BUS_MASTER: Self = Self {
        max_address: 0xFFFF_FFFF,
        alignment: 16,
        boundary: 0,
        requires_contiguous: false,
        max_sg_segments: 8,
        max_segment_size: 0xFFFF,
        max_transfer: 0x1_0000,
        cache_coherent: true,
    };

    /// True when the device accepts more than one segment per transfer.
    pub const fn supports_sg(&self) -> bool {
        self.max_sg_segments > 1
    }

    /// Reject descriptors the validator cannot reason about.
    pub fn check(&self) -> Result<()> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(DmaError::InvalidDescriptor("alignment must be a power of two"));
        }
        if self.boundary != 0 && !self.boundary.is_power_of_two() {
            return Err(DmaError::InvalidDescriptor("boundary must be zero or a power of two"));
        }
        if self.max_transfer == 0 || self.max_segment_size == 0 {
            return Err(DmaError::InvalidDescriptor("transfer and segment sizes must be non-zero"));
        }
        if self.max_sg_segments > MAX_SEGMENTS {
            return Err(DmaError::InvalidDescriptor("scatter-gather segment count too large"));
        }
        Ok(())
    }

    /// Combine two descriptors into one no weaker than either.
    pub fn tighten(&self, other: &Self) -> Self {
        let boundary = match (self.boundary, other.boundary) {
            (0, b) | (b, 0) => b,
            (a, b) => a.min(b),
        };
        Self {
            max_address: self.max_address.min(other.max_address),
            alignment: self.alignment.max(other.alignment),
            boundary,
            requires_contiguous: self.requires_contiguous || other.requires_contiguous,
            max_sg_segments: self.max_sg_segments.min(other.max_sg_segments),
            max_segment_size: self.max_segment_size.min(other.max_segment_size),
            max_transfer: self.max_transfer.min(other.max_transfer),
            cache_coherent: self.cache_coherent && other.cache_coherent,
        }
    }

    /// Bounce-entry placement satisfying this descriptor, with starts aligned
    /// to at least `line_size` so entries never share a cache line.
    pub fn placement(&self, line_size: usize) -> Placement {
        Placement::new(
            self.max_address,
            self.alignment.max(line_size as u64),
            self.boundary,
        )
    }
}

/// Index of a registered device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceClassId(u8);

impl DeviceClassId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    name: &'static str,
    descriptor: ConstraintDescriptor,
}

/// Name-indexed descriptor table.
#[derive(Debug, Clone)]
pub struct ConstraintRegistry {
    entries: [Option<Entry>; MAX_DEVICE_CLASSES],
    count: usize,
}

impl ConstraintRegistry {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_DEVICE_CLASSES],
            count: 0,
        }
    }

    /// Registry holding `isa-busmaster` and `pci-busmaster`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.entries[0] = Some(Entry {
            name: "isa-busmaster",
            descriptor: ConstraintDescriptor::ISA_BUS_MASTER,
        });
        registry.entries[1] = Some(Entry {
            name: "pci-busmaster",
            descriptor: ConstraintDescriptor::PCI_BUS_MASTER,
        });
        registry.count = 2;
        registry
    }

    /// Add a device class.
    pub fn register(
        &mut self,
        name: &'static str,
        descriptor: ConstraintDescriptor,
    ) -> Result<DeviceClassId> {
        descriptor.check()?;
        if self.lookup(name).is_some() {
            return Err(DmaError::DuplicateDeviceClass);
        }
        if self.count == MAX_DEVICE_CLASSES {
            return Err(DmaError::RegistryFull);
        }
        let id = DeviceClassId(self.count as u8);
        self.entries[self.count] = Some(Entry { name, descriptor });
        self.count += 1;
        log::debug!("dma: registered device class '{}' as {:?}", name, id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<DeviceClassId> {
        self.iter()
            .position(|(n, _)| n == name)
            .map(|i| DeviceClassId(i as u8))
    }

    pub fn get(&self, id: DeviceClassId) -> Option<&ConstraintDescriptor> {
        self.entry(id).map(|e| &e.descriptor)
    }

    pub fn name(&self, id: DeviceClassId) -> Option<&'static str> {
        self.entry(id).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// All `(name, descriptor)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ConstraintDescriptor)> + '_ {
        self.entries[..self.count]
            .iter()
            .flatten()
            .map(|e| (e.name, &e.descriptor))
    }

    /// The combination of every registered descriptor.
    pub fn strictest(&self) -> Option<ConstraintDescriptor> {
        self.iter()
            .map(|(_, d)| *d)
            .reduce(|acc, d| acc.tighten(&d))
    }

    fn entry(&self, id: DeviceClassId) -> Option<&Entry> {
        self.entries[..self.count].get(id.index())?.as_ref()
    }
}

impl Default for ConstraintRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let registry = ConstraintRegistry::with_defaults();
        for (name, d) in registry.iter() {
            assert!(d.check().is_ok(), "{name} descriptor rejected");
        }
        let isa = registry.lookup("isa-busmaster").unwrap();
        assert_eq!(registry.get(isa), Some(&ConstraintDescriptor::ISA_BUS_MASTER));
        assert_eq!(registry.name(isa), Some("isa-busmaster"));
        assert!(registry.lookup("eisa").is_none());
    }

    #[test]
    fn test_register_rejects_bad_descriptors() {
        let mut registry = ConstraintRegistry::new();
        let mut d = ConstraintDescriptor::ISA_BUS_MASTER;
        d.alignment = 6;
        assert!(matches!(registry.register("x", d), Err(DmaError::InvalidDescriptor(_))));
        d.alignment = 4;
        d.boundary = 0x3000;
        assert!(matches!(registry.register("x", d), Err(DmaError::InvalidDescriptor(_))));
        d.boundary = 0x1_0000;
        d.max_sg_segments = MAX_SEGMENTS + 1;
        assert!(matches!(registry.register("x", d), Err(DmaError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_register_duplicates_and_capacity() {
        let mut registry = ConstraintRegistry::with_defaults();
        assert_eq!(
            registry.register("isa-busmaster", ConstraintDescriptor::ISA_BUS_MASTER),
            Err(DmaError::DuplicateDeviceClass)
        );
        const NAMES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];
        for name in NAMES {
            registry.register(name, ConstraintDescriptor::PCI_BUS_MASTER).unwrap();
        }
        assert_eq!(
            registry.register("g", ConstraintDescriptor::PCI_BUS_MASTER),
            Err(DmaError::RegistryFull)
        );
    }

    #[test]
    fn test_strictest_combination() {
        let registry = ConstraintRegistry::with_defaults();
        let s = registry.strictest().unwrap();
        assert_eq!(s.max_address, 0x00FF_FFFF);
        assert_eq!(s.alignment, 16);
        assert_eq!(s.boundary, 0x1_0000);
        assert!(s.requires_contiguous);
        assert_eq!(s.max_sg_segments, 1);
        assert!(!s.cache_coherent);
        assert!(ConstraintRegistry::new().strictest().is_none());
    }

    #[test]
    fn test_placement_uses_line_size() {
        let p = ConstraintDescriptor::ISA_BUS_MASTER.placement(64);
        assert_eq!(p.alignment, 64);
        assert_eq!(p.boundary, 0x1_0000);
        assert_eq!(p.max_address, 0x00FF_FFFF);
    }
}
