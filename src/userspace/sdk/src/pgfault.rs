//! Page fault handler registration.

use skerry_common::memlayout::{PGFAULT_UPCALL, PGSIZE, UXSTACKTOP};
use skerry_common::runtime::{PgFaultHandler, UserRuntime};
use skerry_common::{Access, EnvId, PageState, SysError};

use crate::syscall::{env_set_pgfault_upcall, page_alloc};

/// Installs `handler` for this process's page faults.
///
/// The first registration also gives the process its exception stack and
/// points the kernel at the upcall trampoline. Later calls only swap the
/// handler.
pub fn set_pgfault_handler(rt: &mut dyn UserRuntime, handler: PgFaultHandler) -> Result<(), SysError> {
    if rt.pgfault_handler().is_none() {
        let perm = PageState::Private(Access::ReadWrite).flags();
        page_alloc(rt, EnvId::CURRENT, UXSTACKTOP - PGSIZE, perm)?;
        env_set_pgfault_upcall(rt, EnvId::CURRENT, PGFAULT_UPCALL)?;
    }
    rt.set_pgfault_handler(handler);
    Ok(())
}
