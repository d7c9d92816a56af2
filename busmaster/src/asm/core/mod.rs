//! Core ASM primitive bindings.

pub mod barriers;
pub mod cache;
pub mod cpuid;
pub mod irq;
pub mod tsc;
