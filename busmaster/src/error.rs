//! DMA error types

use dma_pool::{PoolError, PoolKind};

use crate::dma::Violations;
use crate::platform::TranslationError;

pub type Result<T> = core::result::Result<T, DmaError>;

/// Errors surfaced by the mapping layer.
///
/// Constraint and translation failures normally never reach the caller; the
/// façade falls back to a bounce buffer first. They surface only when the
/// caller forbids the fallback or when setup is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    /// Range breaks the device's boundary, address, alignment or size rules.
    #[error("constraint violation: {0:?}")]
    ConstraintViolation(Violations),
    /// Memory is virtualized and no translation service is present.
    #[error("physical address untrustworthy: memory is virtualized and no translation service is present")]
    TranslationUnavailable,
    /// The translation service refused or returned garbage.
    #[error("translation service failed: {0}")]
    TranslationFailed(TranslationError),
    /// No free bounce entry large enough.
    #[error("{0:?} bounce pool exhausted")]
    PoolExhausted(PoolKind),
    /// Completion queue full; the mapping stays with its descriptor.
    #[error("completion queue overflow")]
    QueueOverflow,
    /// Transfer flagged by the watchdog.
    #[error("transfer timed out")]
    Timeout,
    #[error("zero-length transfer")]
    ZeroLength,
    #[error("transfer length {len} exceeds buffer of {capacity} bytes")]
    InvalidLength { len: usize, capacity: usize },
    #[error("physical address arithmetic overflow")]
    AddressOverflow,
    /// Bounce entry longer than the device can describe.
    #[error("too many scatter-gather segments")]
    TooManySegments,
    #[error("unknown device class")]
    UnknownDeviceClass,
    #[error("invalid constraint descriptor: {0}")]
    InvalidDescriptor(&'static str),
    #[error("device class already registered")]
    DuplicateDeviceClass,
    #[error("constraint registry full")]
    RegistryFull,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("bounce pool setup failed: {0}")]
    Pool(#[from] PoolError),
}

impl From<TranslationError> for DmaError {
    fn from(err: TranslationError) -> Self {
        Self::TranslationFailed(err)
    }
}
