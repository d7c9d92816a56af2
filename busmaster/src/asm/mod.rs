//! Instruction-level bindings.
//!
//! Thin wrappers over the handful of x86 instructions the DMA layer needs.
//! Every wrapper has a portable fallback so the crate builds and tests on
//! any host.
//!
//! # Module Organization
//! - `core/` - Core primitives (TSC, barriers, cache, CPUID, interrupt flag)

pub mod core;
