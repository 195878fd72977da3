//! The execution environment user-space library code runs against.
//!
//! A user process reaches the kernel through three channels: the syscall
//! trap, the read-only window the kernel maps over the process's own page
//! tables, and ordinary loads and stores to its memory (which may fault).
//! [`UserRuntime`] captures exactly those, plus the two process-local
//! variables the runtime library keeps.

use crate::env::EnvId;
use crate::error::{FaultError, SysError};
use crate::paging::PageTableEntry;
use crate::syscall::Syscall;
use crate::trap::UserFaultRecord;

/// A user-level page fault handler.
///
/// Called on the exception stack with the record the kernel delivered.
/// Returning `Ok` resumes the faulting instruction.
pub type PgFaultHandler = fn(&mut dyn UserRuntime, &UserFaultRecord) -> Result<(), FaultError>;

/// What user code can do without going through a library.
pub trait UserRuntime {
    /// Executes the syscall trap instruction and returns `rax`.
    fn syscall(&mut self, call: Syscall, args: [u64; 5]) -> i64;

    /// Reads this process's page table entry for `va`, if any.
    fn pte(&self, va: u64) -> Option<PageTableEntry>;

    /// Whether any page table covers the `PTSIZE` region containing `va`.
    fn page_table_present(&self, va: u64) -> bool;

    /// Copies one page within this process's address space.
    ///
    /// Faults are taken and delivered like any other access. An error means
    /// the process could not continue.
    fn copy_page(&mut self, dst: u64, src: u64) -> Result<(), SysError>;

    /// Process-local pointer to this environment's identity.
    fn this_env(&self) -> EnvId;

    /// Updates the process-local identity.
    fn set_this_env(&mut self, id: EnvId);

    /// The handler the page fault upcall calls, if one is installed.
    fn pgfault_handler(&self) -> Option<PgFaultHandler>;

    /// Installs the handler the page fault upcall calls.
    fn set_pgfault_handler(&mut self, handler: PgFaultHandler);
}
