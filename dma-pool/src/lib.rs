//! Bounce buffer pools for bus-master DMA.
//!
//! This crate owns the memory-side half of DMA safety: typed physical
//! addresses, DMA-capable regions, and the fixed TX/RX bounce pools that the
//! mapping layer falls back to when a caller's buffer cannot be handed to the
//! device directly.
//!
//! # Design
//!
//! - **No allocation**: every pool is a fixed array carved from a region the
//!   driver supplies at init.
//! - **Pre-validated entries**: carving places each entry so it satisfies a
//!   [`Placement`] (max address, alignment, forbidden boundary). Runtime
//!   acquisition never re-checks.
//! - **Lock-free acquisition**: one atomic in-use flag per entry; the copy
//!   into or out of the bounce buffer happens outside the flag flip.
//! - **Move-only leases**: a [`BounceLease`] is the only handle to an
//!   acquired entry, so one entry can never back two transfers.
//!
//! # Usage
//!
//! ```ignore
//! use dma_pool::{BouncePools, DmaRegion, Placement};
//!
//! let region = unsafe { DmaRegion::new(cpu_ptr, bus_addr, size) };
//! let placement = Placement::new(0x00FF_FFFF, 64, 0x1_0000);
//! let pools = BouncePools::new(&region, 16, 16, 1536, placement)?;
//!
//! let lease = pools.acquire_for_device(&frame).ok_or(Busy)?;
//! // ... device reads lease.phys() ...
//! pools.release(lease, &mut frame);
//! ```

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod bounce;
pub mod region;

pub use addr::{align_down, align_up, PhysAddr};
pub use bounce::{
    BounceLease, BouncePool, BouncePools, Placement, PoolError, PoolKind, DEFAULT_POOL_ENTRIES,
    MAX_POOL_SIZE,
};
pub use region::DmaRegion;
