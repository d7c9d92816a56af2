//! CPUID leaf 1 decoding for cache capabilities.

/// CLFLUSH supported (leaf 1, EDX bit 19).
const EDX_CLFLUSH: u32 = 1 << 19;

/// Raw cache facts from CPUID leaf 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFeatures {
    pub clflush: bool,
    /// CLFLUSH line size in bytes, 0 when not reported.
    pub clflush_line_size: usize,
}

#[cfg(target_arch = "x86_64")]
pub fn cache_features() -> CacheFeatures {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    let leaf = unsafe { ::core::arch::x86_64::__cpuid(1) };
    CacheFeatures {
        clflush: leaf.edx & EDX_CLFLUSH != 0,
        clflush_line_size: (((leaf.ebx >> 8) & 0xFF) as usize) * 8,
    }
}

/// Stub for non-x86_64 targets: no cache line control.
#[cfg(not(target_arch = "x86_64"))]
pub fn cache_features() -> CacheFeatures {
    let _ = EDX_CLFLUSH;
    CacheFeatures {
        clflush: false,
        clflush_line_size: 0,
    }
}
