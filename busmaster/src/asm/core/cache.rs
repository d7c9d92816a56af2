//! Cache management bindings.
//!
//! # Safety
//! CLFLUSH faults on unmapped addresses. WBINVD is privileged (CPL0) and
//! traps when virtualized or run from user mode; callers gate it behind the
//! execution mode.

/// Fallback cache line size when CPUID does not report one.
pub const CACHE_LINE_SIZE: usize = 64;

/// Flush cache line containing address (CLFLUSH).
///
/// Writes back the line if dirty and invalidates it.
///
/// # Safety
/// The address must be mapped memory.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn clflush(addr: *const u8) {
    ::core::arch::asm!("clflush [{}]", in(reg) addr, options(nostack, preserves_flags));
}

/// Write back and invalidate every cache line (WBINVD).
///
/// # Safety
/// Privileged; only call in ring 0 outside virtualization.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn wbinvd() {
    ::core::arch::asm!("wbinvd", options(nostack, preserves_flags));
}

/// Stub for non-x86_64 targets.
///
/// # Safety
/// None required.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub unsafe fn clflush(_addr: *const u8) {
    ::core::sync::atomic::fence(::core::sync::atomic::Ordering::SeqCst);
}

/// Stub for non-x86_64 targets.
///
/// # Safety
/// None required.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub unsafe fn wbinvd() {
    ::core::sync::atomic::fence(::core::sync::atomic::Ordering::SeqCst);
}
