//! Copy-on-write fork.
//!
//! `fork` gives the child the parent's address space without copying it:
//! writable pages become copy-on-write in both, and whichever side writes
//! first takes a page fault that [`pgfault`] answers with a private copy.
//! Pages marked shared stay shared, read-only pages are simply mapped.

use skerry_common::memlayout::{page_round_down, PFTEMP, PGFAULT_UPCALL, PGSIZE, PTSIZE, USTACKTOP, UXSTACKTOP};
use skerry_common::runtime::UserRuntime;
use skerry_common::{
    Access, EnvId, EnvStatus, FaultCode, FaultError, PageState, PageTableEntry, PteFlags, SysError,
    UserFaultRecord,
};

use crate::pgfault::set_pgfault_handler;
use crate::syscall::{
    env_destroy, env_set_pgfault_upcall, env_set_status, exofork, getenvid, page_alloc, page_map, page_unmap,
};

const PRIVATE_RW: PageState = PageState::Private(Access::ReadWrite);
const SHARED_RW: PageState = PageState::SharedDirect(Access::ReadWrite);

/// Page fault handler that privatizes copy-on-write pages.
///
/// Only a write to a copy-on-write page is legitimate; anything else is
/// returned as [`FaultError::NotCopyOnWrite`].
pub fn pgfault(rt: &mut dyn UserRuntime, record: &UserFaultRecord) -> Result<(), FaultError> {
    let va = record.fault_va;
    let cow = rt.pte(va).is_some_and(PageTableEntry::is_copy_on_write);
    if !record.fault_code().contains(FaultCode::WRITE) || !cow {
        return Err(FaultError::NotCopyOnWrite { va, err: record.err });
    }
    privatize(rt, va)?;
    Ok(())
}

/// Replaces the page holding `va` with a private writable copy.
fn privatize(rt: &mut dyn UserRuntime, va: u64) -> Result<(), SysError> {
    let page = page_round_down(va);
    page_alloc(rt, EnvId::CURRENT, PFTEMP, PRIVATE_RW.flags())?;
    rt.copy_page(PFTEMP, page)?;
    page_map(rt, EnvId::CURRENT, PFTEMP, EnvId::CURRENT, page, PRIVATE_RW.flags())?;
    page_unmap(rt, EnvId::CURRENT, PFTEMP)
}

/// Maps this process's page at `va` into `child` at the same address.
///
/// Shared pages keep their permissions. Writable and copy-on-write pages
/// become copy-on-write on both sides. Other pages are mapped read-only.
pub fn duppage(rt: &mut dyn UserRuntime, child: EnvId, va: u64) -> Result<(), SysError> {
    let Some(pte) = rt.pte(va) else {
        return Ok(());
    };
    match pte.state() {
        Some(PageState::SharedDirect(_)) => {
            page_map(rt, EnvId::CURRENT, va, child, va, pte.flags() & PteFlags::SYSCALL)
        }
        Some(PageState::Private(Access::ReadWrite) | PageState::CopyOnWrite) => {
            let cow = PageState::CopyOnWrite.flags();
            page_map(rt, EnvId::CURRENT, va, child, va, cow)?;
            // our own mapping too, even if it already was copy-on-write
            page_map(rt, EnvId::CURRENT, va, EnvId::CURRENT, va, cow)
        }
        Some(state @ PageState::Private(Access::ReadOnly)) => {
            page_map(rt, EnvId::CURRENT, va, child, va, state.flags())
        }
        None => Ok(()),
    }
}

/// Maps the page at `va` into `child` and back into this process as a
/// writable shared page.
fn share_page(rt: &mut dyn UserRuntime, child: EnvId, va: u64) -> Result<(), SysError> {
    let Some(pte) = rt.pte(va) else {
        return Ok(());
    };
    match pte.state() {
        Some(PageState::Private(Access::ReadOnly) | PageState::SharedDirect(Access::ReadOnly)) => {
            page_map(rt, EnvId::CURRENT, va, child, va, pte.flags() & PteFlags::SYSCALL)
        }
        Some(state) => {
            if state == PageState::CopyOnWrite {
                privatize(rt, va)?;
            }
            page_map(rt, EnvId::CURRENT, va, child, va, SHARED_RW.flags())?;
            page_map(rt, EnvId::CURRENT, va, EnvId::CURRENT, va, SHARED_RW.flags())
        }
        None => Ok(()),
    }
}

/// First present page at or above `va` and below `top`, skipping regions
/// without a page table.
fn next_present(rt: &dyn UserRuntime, mut va: u64, top: u64) -> Option<u64> {
    while va < top {
        if !rt.page_table_present(va) {
            va = (va / PTSIZE + 1) * PTSIZE;
            continue;
        }
        if rt.pte(va).is_some_and(PageTableEntry::is_present) {
            return Some(va);
        }
        va += PGSIZE;
    }
    None
}

/// Which pages of the parent a fork hands over how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sharing {
    /// Everything copy-on-write.
    CopyOnWrite,
    /// Everything below the top stack page shared directly.
    Shared,
}

fn fork_with(rt: &mut dyn UserRuntime, sharing: Sharing) -> Result<EnvId, SysError> {
    set_pgfault_handler(rt, pgfault)?;
    let child = exofork(rt)?;
    if child.is_current() {
        let me = getenvid(rt)?;
        rt.set_this_env(me);
        return Ok(EnvId::CURRENT);
    }

    if let Err(err) = populate(rt, child, sharing) {
        log::error!("fork: setting up child {} failed: {}", child, err);
        if let Err(destroy) = env_destroy(rt, child) {
            log::error!("fork: destroying child {} failed: {}", child, destroy);
        }
        return Err(err);
    }
    log::debug!("fork: child {} runnable", child);
    Ok(child)
}

/// Gives `child` its address space, exception stack and upcall, then lets
/// it run.
fn populate(rt: &mut dyn UserRuntime, child: EnvId, sharing: Sharing) -> Result<(), SysError> {
    let stack_page = USTACKTOP - PGSIZE;
    let mut next = next_present(rt, 0, USTACKTOP);
    while let Some(va) = next {
        match sharing {
            Sharing::Shared if va < stack_page => share_page(rt, child, va)?,
            _ => duppage(rt, child, va)?,
        }
        next = next_present(rt, va + PGSIZE, USTACKTOP);
    }

    // the exception stack is never copy-on-write
    page_alloc(rt, child, UXSTACKTOP - PGSIZE, PRIVATE_RW.flags())?;
    env_set_pgfault_upcall(rt, child, PGFAULT_UPCALL)?;
    env_set_status(rt, child, EnvStatus::Runnable)
}

/// Copy-on-write fork.
///
/// Returns the child to the parent and [`EnvId::CURRENT`] to the child.
pub fn fork(rt: &mut dyn UserRuntime) -> Result<EnvId, SysError> {
    fork_with(rt, Sharing::CopyOnWrite)
}

/// Fork that shares all memory but the stack.
///
/// Pages below the top user stack page are shared writable between parent
/// and child; the stack page is handled as in [`fork`].
pub fn sfork(rt: &mut dyn UserRuntime) -> Result<EnvId, SysError> {
    fork_with(rt, Sharing::Shared)
}
