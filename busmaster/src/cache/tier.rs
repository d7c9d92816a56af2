//! Coherency tier selection.

use crate::asm::core::{cache::CACHE_LINE_SIZE, cpuid};
use crate::platform::ExecutionMode;

/// Cache maintenance strategy, chosen once at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// CLFLUSH each line of the buffer.
    PerLineFlush,
    /// WBINVD the whole cache. Expensive, privileged, coalescible.
    GlobalWritebackInvalidate,
    /// Touch each line from software.
    SoftwarePattern,
    /// Hardware keeps caches coherent; do nothing.
    Disabled,
}

impl CacheTier {
    /// True for tiers whose CPU-side sync invalidates lines, which would lose
    /// CPU writes sharing a line with a device-written buffer.
    pub const fn invalidates(self) -> bool {
        matches!(self, Self::PerLineFlush | Self::GlobalWritebackInvalidate)
    }
}

/// Cache capabilities of the running CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCaps {
    pub clflush: bool,
    /// WBINVD exists (486 and later).
    pub wbinvd: bool,
    /// The CPU has a cache at all.
    pub has_cache: bool,
    pub line_size: usize,
}

impl CpuCaps {
    /// Probe through CPUID.
    pub fn detect() -> Self {
        let features = cpuid::cache_features();
        let line_size = match features.clflush_line_size {
            n if n.is_power_of_two() && n >= 16 => n,
            _ => CACHE_LINE_SIZE,
        };
        Self {
            clflush: features.clflush,
            wbinvd: cfg!(target_arch = "x86_64"),
            has_cache: true,
            line_size,
        }
    }

    /// A CPU without any cache.
    pub const fn uncached() -> Self {
        Self {
            clflush: false,
            wbinvd: false,
            has_cache: false,
            line_size: CACHE_LINE_SIZE,
        }
    }
}

/// Preferred tier for `caps` in `mode`.
///
/// Per-line flush, else global flush when the mode allows it, else software
/// touch, else nothing.
pub fn select_tier(caps: &CpuCaps, mode: ExecutionMode) -> CacheTier {
    if caps.clflush {
        CacheTier::PerLineFlush
    } else if caps.wbinvd && mode.permits_global_flush() {
        CacheTier::GlobalWritebackInvalidate
    } else if caps.has_cache {
        CacheTier::SoftwarePattern
    } else {
        CacheTier::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(clflush: bool, wbinvd: bool, has_cache: bool) -> CpuCaps {
        CpuCaps {
            clflush,
            wbinvd,
            has_cache,
            line_size: 64,
        }
    }

    #[test]
    fn test_selection_order() {
        let flat = ExecutionMode::Unvirtualized;
        let virt = ExecutionMode::Virtualized;
        assert_eq!(select_tier(&caps(true, true, true), virt), CacheTier::PerLineFlush);
        assert_eq!(select_tier(&caps(false, true, true), flat), CacheTier::GlobalWritebackInvalidate);
        assert_eq!(select_tier(&caps(false, true, true), virt), CacheTier::SoftwarePattern);
        assert_eq!(select_tier(&caps(false, false, true), flat), CacheTier::SoftwarePattern);
        assert_eq!(select_tier(&CpuCaps::uncached(), flat), CacheTier::Disabled);
    }

    #[test]
    fn test_detect_line_size_sane() {
        let caps = CpuCaps::detect();
        assert!(caps.line_size.is_power_of_two());
        assert!(caps.line_size >= 16);
    }
}
