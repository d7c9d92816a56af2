//! Cache maintenance backend.

use crate::asm::core::{barriers, cache};

/// Raw cache maintenance operations the coherency manager drives.
pub trait CacheOps {
    /// Write back (if dirty) and invalidate the line holding `addr`.
    ///
    /// # Safety
    /// `addr` must be mapped memory.
    unsafe fn flush_line(&self, addr: *const u8);

    /// Write back and invalidate every line in every cache.
    ///
    /// # Safety
    /// Privileged. Only called when the execution mode permits it.
    unsafe fn write_back_invalidate_all(&self);

    /// Order preceding maintenance before later device-visible accesses.
    fn fence(&self);
}

impl<T: CacheOps + ?Sized> CacheOps for &T {
    unsafe fn flush_line(&self, addr: *const u8) {
        (**self).flush_line(addr)
    }

    unsafe fn write_back_invalidate_all(&self) {
        (**self).write_back_invalidate_all()
    }

    fn fence(&self) {
        (**self).fence()
    }
}

/// x86 instructions: CLFLUSH, WBINVD, MFENCE.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareCacheOps;

impl CacheOps for HardwareCacheOps {
    #[inline]
    unsafe fn flush_line(&self, addr: *const u8) {
        cache::clflush(addr);
    }

    #[inline]
    unsafe fn write_back_invalidate_all(&self) {
        cache::wbinvd();
    }

    #[inline]
    fn fence(&self) {
        barriers::mfence();
    }
}
