//! The system call relay.
//!
//! Environments may act only on themselves and their immediate children.
//! Every user address must lie below `UTOP`; page operations also require
//! it to be page aligned.

use alloc::vec;

use skerry_common::memlayout::{is_page_aligned, UTOP};
use skerry_common::syscall::Syscall;
use skerry_common::{EnvId, EnvStatus, PageTableEntry, PteFlags, SysError};

use crate::cpu::TrapContext;
use crate::env::Destroyed;
use crate::{cprint, cprintln, Kernel};

fn check_page_va(va: u64) -> Result<(), SysError> {
    if va >= UTOP || !is_page_aligned(va) {
        return Err(SysError::Invalid);
    }
    Ok(())
}

impl Kernel {
    /// Runs syscall `call` for the current environment.
    pub fn syscall(&mut self, cx: &mut TrapContext<'_>, call: Syscall, args: [u64; 5]) -> Result<u64, SysError> {
        let caller = cx.cpu.current.ok_or(SysError::BadEnv)?;
        let [a1, a2, a3, a4, a5] = args;
        log::trace!("[{}] syscall {:?} {:x?}", caller, call, args);

        match call {
            Syscall::Cputs => self.sys_cputs(cx, caller, a1, a2).map(|()| 0),
            Syscall::GetEnvId => Ok(u64::from(caller.as_raw())),
            Syscall::EnvDestroy => self.sys_env_destroy(cx, caller, env_arg(a1)).map(|()| 0),
            Syscall::Yield => Ok(0),
            Syscall::Exofork => self.sys_exofork(caller).map(|id| u64::from(id.as_raw())),
            Syscall::EnvSetStatus => self.sys_env_set_status(caller, env_arg(a1), a2).map(|()| 0),
            Syscall::PageAlloc => self.sys_page_alloc(caller, env_arg(a1), a2, a3).map(|()| 0),
            Syscall::PageMap => self
                .sys_page_map(caller, env_arg(a1), a2, env_arg(a3), a4, a5)
                .map(|()| 0),
            Syscall::PageUnmap => self.sys_page_unmap(caller, env_arg(a1), a2).map(|()| 0),
            Syscall::EnvSetPgfaultUpcall => self
                .sys_env_set_pgfault_upcall(caller, env_arg(a1), a2)
                .map(|()| 0),
        }
    }

    /// Prints a string from the caller's memory. A bad buffer destroys the
    /// caller.
    fn sys_cputs(&mut self, cx: &mut TrapContext<'_>, caller: EnvId, va: u64, len: u64) -> Result<(), SysError> {
        let checked = self
            .envs
            .get(caller)
            .ok_or(SysError::BadEnv)?
            .space
            .check_user(va, len, PteFlags::empty());
        if let Err(bad_va) = checked {
            cprintln!(cx.machine, "[{}] user_mem_check assertion failure for va {:08x}", caller, bad_va);
            self.env_destroy(cx, caller);
            return Err(SysError::Fault);
        }

        let mut buf = vec![0u8; len as usize];
        let env = self.envs.get(caller).ok_or(SysError::BadEnv)?;
        env.space
            .read(&self.memory, va, &mut buf)
            .map_err(|_| SysError::Fault)?;
        for &byte in &buf {
            cprint!(cx.machine, "{}", byte as char);
        }
        Ok(())
    }

    fn sys_env_destroy(&mut self, cx: &mut TrapContext<'_>, caller: EnvId, id: EnvId) -> Result<(), SysError> {
        let id = self.envs.lookup(id, caller, true)?;
        if id == caller {
            cprintln!(cx.machine, "[{}] exiting gracefully", caller);
        } else {
            cprintln!(cx.machine, "[{}] destroying {}", caller, id);
        }
        if self.env_destroy(cx, id) == Destroyed::Deferred {
            log::debug!("[{}] destroy of {} deferred", caller, id);
        }
        Ok(())
    }

    /// Creates a child that resumes like the caller but sees 0 from this
    /// call. It starts NotRunnable with an empty address space.
    fn sys_exofork(&mut self, caller: EnvId) -> Result<EnvId, SysError> {
        let frame = self.envs.get(caller).ok_or(SysError::BadEnv)?.frame;
        let child = self.env_alloc(caller)?;
        let env = self.envs.get_mut(child).ok_or(SysError::BadEnv)?;
        env.status = EnvStatus::NotRunnable;
        env.frame = frame;
        env.frame.regs.rax = 0;
        Ok(child)
    }

    fn sys_env_set_status(&mut self, caller: EnvId, id: EnvId, status: u64) -> Result<(), SysError> {
        let status = EnvStatus::try_from(status)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::Invalid);
        }
        let id = self.envs.lookup(id, caller, true)?;
        let env = self.envs.get_mut(id).ok_or(SysError::BadEnv)?;
        env.status = status;
        Ok(())
    }

    /// Maps a fresh zeroed page at `va` in `id`, replacing any mapping.
    fn sys_page_alloc(&mut self, caller: EnvId, id: EnvId, va: u64, perm: u64) -> Result<(), SysError> {
        check_page_va(va)?;
        let flags = PteFlags::validate_user(perm)?;
        let id = self.envs.lookup(id, caller, true)?;

        let pfn = self.memory.alloc_zeroed()?;
        let pte = match PageTableEntry::with_flags(pfn, flags) {
            Ok(pte) => pte,
            Err(err) => {
                self.memory.decref(pfn);
                return Err(err);
            }
        };
        let env = self.envs.get_mut(id).ok_or(SysError::BadEnv)?;
        env.space.insert(&mut self.memory, va, pte);
        Ok(())
    }

    /// Maps `src`'s page at `srcva` into `dst` at `dstva`.
    ///
    /// Write permission cannot be granted on a page the source maps
    /// read-only.
    fn sys_page_map(
        &mut self,
        caller: EnvId,
        src: EnvId,
        srcva: u64,
        dst: EnvId,
        dstva: u64,
        perm: u64,
    ) -> Result<(), SysError> {
        check_page_va(srcva)?;
        check_page_va(dstva)?;
        let src = self.envs.lookup(src, caller, true)?;
        let dst = self.envs.lookup(dst, caller, true)?;
        let flags = PteFlags::validate_user(perm)?;

        let src_pte = self
            .envs
            .get(src)
            .and_then(|env| env.space.lookup(srcva))
            .filter(|pte| pte.is_present())
            .ok_or(SysError::Invalid)?;
        if flags.contains(PteFlags::WRITABLE) && !src_pte.flags().contains(PteFlags::WRITABLE) {
            return Err(SysError::Invalid);
        }

        let pte = PageTableEntry::with_flags(src_pte.frame(), flags)?;
        let env = self.envs.get_mut(dst).ok_or(SysError::BadEnv)?;
        env.space.insert(&mut self.memory, dstva, pte);
        Ok(())
    }

    fn sys_page_unmap(&mut self, caller: EnvId, id: EnvId, va: u64) -> Result<(), SysError> {
        check_page_va(va)?;
        let id = self.envs.lookup(id, caller, true)?;
        let env = self.envs.get_mut(id).ok_or(SysError::BadEnv)?;
        env.space.remove(&mut self.memory, va);
        Ok(())
    }

    fn sys_env_set_pgfault_upcall(&mut self, caller: EnvId, id: EnvId, entry: u64) -> Result<(), SysError> {
        let id = self.envs.lookup(id, caller, true)?;
        let env = self.envs.get_mut(id).ok_or(SysError::BadEnv)?;
        env.pgfault_upcall = Some(entry);
        log::debug!("[{}] page fault upcall of {} at {:#x}", caller, id, entry);
        Ok(())
    }
}

fn env_arg(raw: u64) -> EnvId {
    EnvId::from_raw(raw as u32)
}
