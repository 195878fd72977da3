//! Hosted test infrastructure.
//!
//! Runs the kernel against a [`HostMachine`] made of plain data, so the
//! trap layer, the scheduler and the user-level fork library can be
//! exercised on the build host.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skerry_kernel::testutil::Harness;
//!
//! let mut h = Harness::boot(1);
//! let env = h.spawn()?;
//! h.process(env).write_u8(0x80_0000, 0x41)?;
//! ```

pub mod harness;
pub mod machine;
pub mod process;

pub use harness::{host_trampoline, Harness, TrapRecord, UserState, HOST_VECTORS, KERNEL_RIP};
pub use machine::{HostMachine, Symbol};
pub use process::{Insn, UserProcess};
