//! DMA safety and mapping layer for bus-master NIC drivers.
//!
//! Everything a driver needs to hand memory to a bus-master device without
//! corrupting it: physical address resolution that refuses to guess under
//! virtualized memory, boundary and constraint validation, bounce-buffer
//! fallback, tiered cache maintenance, and a lock-free completion queue that
//! moves unmap work out of interrupt context.
//!
//! # Architecture
//!
//! ```text
//!   tx/rx path ──map──▶ DmaMapper ─┬─ AddressResolver ── TranslationService
//!                                  ├─ BoundaryValidator
//!                                  ├─ BouncePools (dma-pool)
//!                                  └─ CoherencyManager ── CacheOps
//!
//!   ISR ──Producer::queue_completion──▶ CompletionQueue ──Consumer::process──▶ DmaMapper::unmap
//! ```
//!
//! The interrupt handler only ever holds a [`completion::Producer`]. It has
//! no path to the resolver, the pools, or the translation service, so the
//! rule that unmapping never happens in interrupt context is enforced by the
//! types rather than by a runtime flag.
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = ConstraintRegistry::with_defaults();
//! let isa = registry.lookup("isa-busmaster").unwrap();
//!
//! let resolver = AddressResolver::<NoTranslation>::unvirtualized(LinearMap::IDENTITY);
//! let mut dma = DmaMapper::init(
//!     &DmaConfig::default(), registry, resolver, &bounce_region,
//!     CpuCaps::detect(), HardwareCacheOps, TscClock::new(tsc_hz),
//! )?;
//!
//! let mapping = dma.map_tx(isa, frame, frame_len, MapFlags::empty())
//!     .map_err(|f| f.error)?;
//! nic.arm_tx(slot, mapping.segments());
//! table.attach(slot, mapping);
//! ```

#![cfg_attr(not(test), no_std)]

pub mod asm;
pub mod cache;
pub mod completion;
pub mod config;
pub mod constraints;
pub mod dma;
pub mod error;
pub mod platform;
pub mod stats;
pub mod sync;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheOps, CacheTier, CoherencyConfig, CoherencyManager, CpuCaps, HardwareCacheOps};
pub use completion::{
    Completion, CompletionQueue, CompletionRecord, CompletionStatus, Consumer, DescriptorRing,
    MappingTable, Producer, Rejected, RingService,
};
pub use config::DmaConfig;
pub use constraints::{ConstraintDescriptor, ConstraintRegistry, DeviceClassId};
pub use dma::{
    AddressResolver, BoundaryValidator, Direction, DmaBuffer, DmaMapper, MapFailure, MapFlags,
    Mapping, MappingKind, Segment, SegmentList, Unmap, Violations,
};
pub use dma_pool::{BouncePools, DmaRegion, PhysAddr, PoolKind};
pub use error::{DmaError, Result};
pub use platform::{ExecutionMode, LinearMap, NoTranslation, TranslationService};
pub use stats::StatsSnapshot;
pub use time::{Clock, TickClock, TscClock};
