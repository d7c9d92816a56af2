//! Address resolution.
//!
//! Turns a CPU buffer address into a physical description the validator can
//! judge, and says whether that description can be trusted.
//!
//! # Policy
//!
//! 1. Translation service present: ask it. One segment covering the request
//!    is contiguous; several segments are reported as non-contiguous.
//! 2. No service, memory virtualized: fail closed with
//!    [`DmaError::TranslationUnavailable`]. Never fall back to arithmetic.
//! 3. No service, unvirtualized: [`LinearMap`] arithmetic.
//!
//! Every successful lock is paired with exactly one [`AddressResolver::release`].

use dma_pool::PhysAddr;

use super::segment::SegmentList;
use super::Direction;
use crate::error::{DmaError, Result};
use crate::platform::{
    ExecutionMode, LinearMap, TranslatedRegion, TranslationError, TranslationHandle,
    TranslationService,
};

/// A resolved buffer.
#[derive(Debug)]
pub struct Resolution {
    /// Physical start of the first segment.
    pub phys: PhysAddr,
    /// Single segment covering the whole request.
    pub contiguous: bool,
    pub segments: SegmentList,
    /// Present when the translation service pinned the buffer.
    pub handle: Option<TranslationHandle>,
}

impl Resolution {
    pub fn translation_used(&self) -> bool {
        self.handle.is_some()
    }
}

/// Resolver for one platform.
pub struct AddressResolver<T> {
    mode: ExecutionMode,
    linear: LinearMap,
    service: Option<T>,
    outstanding: usize,
}

impl<T: TranslationService> AddressResolver<T> {
    pub fn new(mode: ExecutionMode, linear: LinearMap, service: Option<T>) -> Self {
        match (&service, mode) {
            (Some(_), _) => log::info!("dma: resolver using platform translation service ({:?})", mode),
            (None, ExecutionMode::Virtualized) => {
                log::warn!("dma: virtualized memory without translation service; direct mapping disabled")
            }
            (None, ExecutionMode::Unvirtualized) => log::info!("dma: resolver using linear address arithmetic"),
        }
        Self {
            mode,
            linear,
            service,
            outstanding: 0,
        }
    }

    /// Resolver for flat memory with no service.
    pub fn unvirtualized(linear: LinearMap) -> Self {
        Self::new(ExecutionMode::Unvirtualized, linear, None)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn has_translation(&self) -> bool {
        self.service.is_some()
    }

    pub fn service(&self) -> Option<&T> {
        self.service.as_ref()
    }

    /// Locks currently held.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Resolve `len` bytes at CPU address `virt`.
    pub fn resolve(&mut self, virt: usize, len: usize, direction: Direction) -> Result<Resolution> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }

        if let Some(service) = self.service.as_mut() {
            let TranslatedRegion { segments, handle } = service.lock(virt, len, direction)?;
            let described = segments.total_len();
            let Some(first) = segments.first().copied() else {
                Self::unlock_quietly(service, handle);
                return Err(TranslationError::ShortTranslation { requested: len, described }.into());
            };
            if described != len {
                Self::unlock_quietly(service, handle);
                return Err(TranslationError::ShortTranslation { requested: len, described }.into());
            }
            self.outstanding += 1;
            return Ok(Resolution {
                phys: first.addr,
                contiguous: segments.len() == 1,
                segments,
                handle: Some(handle),
            });
        }

        match self.mode {
            ExecutionMode::Virtualized => Err(DmaError::TranslationUnavailable),
            ExecutionMode::Unvirtualized => {
                let phys = self.linear.translate(virt).ok_or(DmaError::AddressOverflow)?;
                phys.checked_last(len).ok_or(DmaError::AddressOverflow)?;
                Ok(Resolution {
                    phys,
                    contiguous: true,
                    segments: SegmentList::single(phys, len),
                    handle: None,
                })
            }
        }
    }

    /// Release a lock taken by [`AddressResolver::resolve`].
    pub fn release(&mut self, handle: TranslationHandle) -> Result<()> {
        let service = self.service.as_mut().ok_or(DmaError::TranslationUnavailable)?;
        self.outstanding = self.outstanding.saturating_sub(1);
        service.unlock(handle).map_err(DmaError::from)
    }

    fn unlock_quietly(service: &mut T, handle: TranslationHandle) {
        if let Err(err) = service.unlock(handle) {
            log::warn!("dma: unlock after bad translation failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NoTranslation;
    use crate::testing::ScriptedTranslation;

    #[test]
    fn test_linear_resolution() {
        let mut r = AddressResolver::<NoTranslation>::unvirtualized(LinearMap::new(
            0x1000,
            PhysAddr::new(0x0010_0000),
        ));
        let res = r.resolve(0x1800, 64, Direction::ToDevice).unwrap();
        assert_eq!(res.phys, PhysAddr::new(0x0010_0800));
        assert!(res.contiguous);
        assert!(!res.translation_used());
        assert_eq!(r.resolve(0x800, 64, Direction::ToDevice).err(), Some(DmaError::AddressOverflow));
        assert_eq!(r.resolve(0x1800, 0, Direction::ToDevice).err(), Some(DmaError::ZeroLength));
    }

    #[test]
    fn test_virtualized_without_service_fails_closed() {
        let mut r = AddressResolver::<NoTranslation>::new(
            ExecutionMode::Virtualized,
            LinearMap::IDENTITY,
            None,
        );
        assert_eq!(
            r.resolve(0x1000, 64, Direction::FromDevice).err(),
            Some(DmaError::TranslationUnavailable)
        );
    }

    #[test]
    fn test_service_single_segment_is_contiguous() {
        let service = ScriptedTranslation::contiguous(PhysAddr::new(0x0020_0000));
        let mut r = AddressResolver::new(ExecutionMode::Virtualized, LinearMap::IDENTITY, Some(service));
        let res = r.resolve(0xDEAD_0000, 512, Direction::ToDevice).unwrap();
        assert!(res.contiguous);
        assert_eq!(res.phys, PhysAddr::new(0x0020_0000));
        assert_eq!(r.outstanding(), 1);

        r.release(res.handle.unwrap()).unwrap();
        assert_eq!(r.outstanding(), 0);
    }

    #[test]
    fn test_service_multi_segment_is_not_contiguous() {
        let service = ScriptedTranslation::scattered(&[0x0030_0000, 0x0050_0000, 0x0040_0000]);
        let mut r = AddressResolver::new(ExecutionMode::Virtualized, LinearMap::IDENTITY, Some(service));
        let res = r.resolve(0x1000, 3 * 0x400, Direction::ToDevice).unwrap();
        assert!(!res.contiguous);
        assert_eq!(res.segments.len(), 3);
        assert_eq!(res.phys, PhysAddr::new(0x0030_0000));
    }

    #[test]
    fn test_short_translation_is_unlocked() {
        let mut service = ScriptedTranslation::contiguous(PhysAddr::new(0x0020_0000));
        service.short_by = 16;
        let mut r = AddressResolver::new(ExecutionMode::Virtualized, LinearMap::IDENTITY, Some(service));
        let err = r.resolve(0x1000, 256, Direction::ToDevice).err().unwrap();
        assert!(matches!(err, DmaError::TranslationFailed(TranslationError::ShortTranslation { .. })));
        assert_eq!(r.outstanding(), 0);
        assert_eq!(r.service().unwrap().unlocks(), 1);
    }
}
