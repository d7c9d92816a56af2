//! Interrupt flag bindings.
//!
//! Only bare-metal x86_64 builds touch RFLAGS.IF. Hosted builds (tests, user
//! space tools) cannot execute CLI/STI, so there the functions are no-ops and
//! interrupts read as disabled.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    /// Check if interrupts are enabled.
    #[inline]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe { ::core::arch::asm!("pushfq; pop {}", out(reg) rflags) };
        (rflags & 0x200) != 0
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        unsafe { ::core::arch::asm!("cli", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn enable_interrupts() {
        unsafe { ::core::arch::asm!("sti", options(nomem, nostack)) };
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    #[inline]
    pub fn interrupts_enabled() -> bool {
        false
    }

    #[inline(always)]
    pub fn disable_interrupts() {}

    #[inline(always)]
    pub fn enable_interrupts() {}
}

pub use imp::{disable_interrupts, enable_interrupts, interrupts_enabled};
