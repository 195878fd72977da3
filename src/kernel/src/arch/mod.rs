//! Architecture-specific implementations.
//!
//! Only compiled for bare-metal x86_64. Everything else in the kernel talks
//! to the hardware through [`crate::Machine`], so hosted builds get by
//! without this module.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
