//! Synchronization primitives for the trap path.
//!
//! - [`BigKernelLock`]: the single lock serializing kernel execution that
//!   originates from user-mode traps.
//! - [`TrapNesting`]: per-CPU detection of traps taken inside the trap path.

mod kernel_lock;
mod nesting;

pub use kernel_lock::{BigKernelLock, LockError};
pub use nesting::{NestingError, NestingGuard, TrapNesting};
