//! DMA mapping module.
//!
//! Resolution, validation and the map/unmap façade built on top of them.
//!
//! # State Machine
//!
//! ```text
//!   Unmapped ──map──▶ Mapping ─┬─▶ Direct      ─┐
//!                              ├─▶ Translated  ─┼──unmap──▶ Unmapped
//!                              └─▶ Bounced     ─┘
//! ```

pub mod buffer;
pub mod mapping;
pub mod resolve;
pub mod segment;
pub mod validate;

pub use buffer::DmaBuffer;
pub use mapping::{DmaMapper, MapFailure, MapFlags, Mapping, MappingKind, Unmap};
pub use resolve::{AddressResolver, Resolution};
pub use segment::{Segment, SegmentList, MAX_SEGMENTS};
pub use validate::{BoundaryValidator, Classification, SplitError, Violations};

/// Transfer direction, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// CPU writes, device reads (transmit).
    ToDevice,
    /// Device writes, CPU reads (receive).
    FromDevice,
    /// Both.
    Bidirectional,
}

impl Direction {
    /// Device reads the buffer.
    pub const fn device_reads(self) -> bool {
        !matches!(self, Self::FromDevice)
    }

    /// Device writes the buffer.
    pub const fn device_writes(self) -> bool {
        !matches!(self, Self::ToDevice)
    }
}
