//! Platform description: execution mode, linear address arithmetic, and the
//! optional address-translation service.
//!
//! # Execution modes
//!
//! ```text
//!   Unvirtualized   physical = phys_base + (virt - virt_base)   always trusted
//!   Virtualized     physical known only through TranslationService::lock
//!                   no service => resolution fails closed
//! ```

use dma_pool::PhysAddr;

use crate::dma::{Direction, SegmentList};

/// How the CPU currently maps memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Linear addresses equal (offset) physical addresses.
    Unvirtualized,
    /// Paging or a hypervisor sits between linear and physical addresses.
    Virtualized,
}

impl ExecutionMode {
    /// Whether a privileged global cache flush is safe to execute.
    pub const fn permits_global_flush(self) -> bool {
        matches!(self, Self::Unvirtualized)
    }
}

// ============================================================================
// Linear arithmetic
// ============================================================================

/// Deterministic CPU-to-bus mapping for unvirtualized memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearMap {
    virt_base: usize,
    phys_base: PhysAddr,
}

impl LinearMap {
    /// Identity mapping.
    pub const IDENTITY: Self = Self::new(0, PhysAddr::ZERO);

    /// Map CPU addresses from `virt_base` upwards onto `phys_base` upwards.
    pub const fn new(virt_base: usize, phys_base: PhysAddr) -> Self {
        Self {
            virt_base,
            phys_base,
        }
    }

    /// Physical address of `virt`. `None` below the window or on overflow.
    pub fn translate(&self, virt: usize) -> Option<PhysAddr> {
        let offset = virt.checked_sub(self.virt_base)?;
        self.phys_base.checked_add(offset as u64)
    }
}

// ============================================================================
// Translation service
// ============================================================================

/// Translation service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    #[error("translation service unavailable")]
    Unavailable,
    #[error("lock refused with status {0:#04x}")]
    LockFailed(u8),
    #[error("region needs more segments than the service can return")]
    TooManySegments,
    #[error("service described {described} of {requested} bytes")]
    ShortTranslation { requested: usize, described: usize },
    #[error("unknown or already released handle")]
    InvalidHandle,
}

/// Opaque lock handle returned by a [`TranslationService`].
///
/// Not `Clone`: each lock is unlocked exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct TranslationHandle(u32);

impl TranslationHandle {
    /// Wrap a service-specific handle value. For service implementations.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// Result of a successful lock.
#[derive(Debug)]
pub struct TranslatedRegion {
    pub segments: SegmentList,
    pub handle: TranslationHandle,
}

/// Platform mechanism that pins a buffer and reports its true physical
/// placement.
///
/// Calls may block and are never made from interrupt context.
pub trait TranslationService {
    /// Pin `len` bytes at CPU address `virt` and describe them physically.
    fn lock(
        &mut self,
        virt: usize,
        len: usize,
        direction: Direction,
    ) -> Result<TranslatedRegion, TranslationError>;

    /// Release a lock returned by [`TranslationService::lock`].
    fn unlock(&mut self, handle: TranslationHandle) -> Result<(), TranslationError>;
}

/// Placeholder service type for platforms that have none.
///
/// Uninhabited: `Option<NoTranslation>` is always `None`.
#[derive(Debug)]
pub enum NoTranslation {}

impl TranslationService for NoTranslation {
    fn lock(&mut self, _: usize, _: usize, _: Direction) -> Result<TranslatedRegion, TranslationError> {
        match *self {}
    }

    fn unlock(&mut self, _: TranslationHandle) -> Result<(), TranslationError> {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_identity() {
        assert_eq!(LinearMap::IDENTITY.translate(0x1234), Some(PhysAddr::new(0x1234)));
    }

    #[test]
    fn test_linear_window() {
        let map = LinearMap::new(0x8000, PhysAddr::new(0x0FFF_8000));
        assert_eq!(map.translate(0x8010), Some(PhysAddr::new(0x0FFF_8010)));
        assert_eq!(map.translate(0x7FFF), None);

        let top = LinearMap::new(0, PhysAddr::new(u64::MAX));
        assert_eq!(top.translate(1), None);
    }

    #[test]
    fn test_global_flush_permission() {
        assert!(ExecutionMode::Unvirtualized.permits_global_flush());
        assert!(!ExecutionMode::Virtualized.permits_global_flush());
    }
}
