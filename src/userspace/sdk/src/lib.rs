//! User-space library for Skerry programs.
//!
//! Typed wrappers around the system calls, page fault handler registration
//! and copy-on-write `fork`. Everything runs against a
//! [`UserRuntime`](skerry_common::runtime::UserRuntime), the process's view
//! of the machine.

#![cfg_attr(not(test), no_std)]

pub mod fork;
pub mod pgfault;
pub mod syscall;

pub use fork::{duppage, fork, pgfault, sfork};
pub use pgfault::set_pgfault_handler;
pub use skerry_common::runtime::UserRuntime;
pub use syscall::*;

use skerry_common::EnvId;

/// Ends the calling environment.
pub fn exit(rt: &mut dyn UserRuntime) {
    if let Err(err) = env_destroy(rt, EnvId::CURRENT) {
        log::error!("exit: {}", err);
    }
}
