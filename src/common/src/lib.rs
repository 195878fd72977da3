//! Types shared between the Skerry kernel and user space.
//!
//! Everything in this crate is part of the kernel/user ABI: environment
//! identifiers, error codes, the virtual memory layout, trap numbers and the
//! fault record the kernel writes onto a user exception stack.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod memlayout;
pub mod paging;
pub mod runtime;
pub mod syscall;
pub mod trap;

pub use env::{EnvId, EnvStatus};
pub use error::{FaultError, SysError};
pub use paging::{Access, PageState, PageTableEntry, PteFlags};
pub use trap::{FaultCode, PushRegs, UserFaultRecord};
