//! Memory barrier bindings.
//!
//! On non-x86 targets every barrier degrades to a sequentially consistent
//! compiler and hardware fence.

/// Full memory fence (MFENCE).
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn mfence() {
    unsafe { ::core::arch::asm!("mfence", options(nostack, preserves_flags)) };
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn mfence() {
    ::core::sync::atomic::fence(::core::sync::atomic::Ordering::SeqCst);
}
