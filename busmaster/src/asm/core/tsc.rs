//! TSC (Time Stamp Counter) bindings.
//!
//! # Safety
//! TSC reads are always safe. Requires invariant TSC (verify via CPUID at boot).

/// Read TSC (non-serializing).
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn read_tsc() -> u64 {
    unsafe { ::core::arch::x86_64::_rdtsc() }
}

/// Stub for non-x86_64 targets.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn read_tsc() -> u64 {
    0
}
