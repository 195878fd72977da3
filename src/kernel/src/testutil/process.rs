//! A user program's view of one environment.
//!
//! [`UserProcess`] plays the part of the code running in user mode: its
//! system calls and memory accesses become real traps through the
//! dispatcher, and when the kernel resumes it at the page fault upcall it
//! runs the installed handler and returns the way the upcall trampoline
//! would.

use alloc::format;

use skerry_common::memlayout::{PGFAULT_UPCALL, PGSIZE};
use skerry_common::runtime::{PgFaultHandler, UserRuntime};
use skerry_common::syscall::Syscall;
use skerry_common::trap::{T_BRKPT, T_DEBUG, T_PGFLT, T_SYSCALL};
use skerry_common::{EnvId, EnvStatus, FaultError, PageTableEntry, SysError, UserFaultRecord};

use super::harness::Harness;
use crate::cpu::CpuStatus;
use crate::sched::Transfer;
use crate::trap::CapturedFrame;

/// Length of the `int $0x30` instruction.
const INT_LEN: u64 = 2;
/// Length of the `int3` instruction.
const INT3_LEN: u64 = 1;
/// Faults one access may take before the harness gives up on it.
const MAX_FAULTS: usize = 8;

/// An instruction the process can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// Breakpoint.
    Int3,
    /// Any instruction of `len` bytes that does not trap by itself.
    Nop {
        /// Encoded length.
        len: u64,
    },
}

/// User-mode code of one environment.
pub struct UserProcess<'h> {
    harness: &'h mut Harness,
    cpu: usize,
    env: EnvId,
}

impl<'h> UserProcess<'h> {
    pub(super) fn new(harness: &'h mut Harness, cpu: usize, env: EnvId) -> Self {
        Self { harness, cpu, env }
    }

    /// The environment this process runs in.
    pub fn env(&self) -> EnvId {
        self.env
    }

    /// The harness.
    pub fn harness(&mut self) -> &mut Harness {
        self.harness
    }

    /// Makes sure the environment is the one running on this CPU and
    /// returns its registers.
    pub fn resume(&mut self) -> Result<CapturedFrame, SysError> {
        let h = &mut *self.harness;
        let env = h.kernel.envs.get(self.env).ok_or(SysError::BadEnv)?;
        let cpu = &h.cpus[self.cpu];
        if cpu.current == Some(self.env) && env.status == EnvStatus::Running {
            return Ok(env.frame);
        }
        if env.status != EnvStatus::Runnable {
            return Err(SysError::BadEnv);
        }

        let id = cpu.id();
        if !h.kernel.lock().holding(id) && !matches!(h.kernel.lock().try_acquire(id), Ok(true)) {
            return Err(SysError::Unspecified);
        }
        let mut cx = crate::TrapContext::new(&mut h.cpus[self.cpu], &mut h.machine);
        cx.cpu.status = CpuStatus::Started;
        match h.kernel.env_run(&mut cx, self.env) {
            Transfer::Enter { frame, .. } => Ok(frame),
            _ => Err(SysError::BadEnv),
        }
    }

    /// Traps into the kernel from the current registers, after `edit`.
    fn raise(&mut self, trapno: u8, err: u64, edit: impl FnOnce(&mut CapturedFrame)) -> Result<(), SysError> {
        let mut frame = self.resume()?;
        frame.trapno = u64::from(trapno);
        frame.err = err;
        edit(&mut frame);
        let transfer = self.harness.trap(self.cpu, frame);
        self.settle(transfer)
    }

    /// Follows the kernel's decision. Runs the fault handler when the kernel
    /// resumed this process at the upcall.
    fn settle(&mut self, transfer: Transfer) -> Result<(), SysError> {
        match transfer {
            Transfer::Enter { env, frame } if env == self.env && frame.rip == PGFAULT_UPCALL => self.upcall(frame),
            _ if self.harness.alive(self.env) => Ok(()),
            _ => Err(SysError::BadEnv),
        }
    }

    /// The upcall trampoline: call the handler with the record at the top
    /// of the exception stack, then restore the trap-time registers from it.
    fn upcall(&mut self, frame: CapturedFrame) -> Result<(), SysError> {
        let record_va = frame.rsp;
        self.harness.upcalls.push(record_va);

        let mut bytes = [0u8; UserFaultRecord::SIZE as usize];
        {
            let h = &*self.harness;
            let env = h.kernel.envs.get(self.env).ok_or(SysError::BadEnv)?;
            env.space
                .read(&h.kernel.memory, record_va, &mut bytes)
                .map_err(|_| SysError::Fault)?;
        }
        let record = UserFaultRecord::from_bytes(&bytes).ok_or(SysError::Fault)?;

        let handler = self.harness.user.get(&self.env).and_then(|state| state.handler);
        let result = match handler {
            Some(handler) => handler(self, &record),
            None => Err(FaultError::Syscall(SysError::Invalid)),
        };

        match result {
            Ok(()) => {
                let env = self.harness.kernel.envs.get_mut(self.env).ok_or(SysError::BadEnv)?;
                env.frame.regs = record.regs;
                env.frame.rflags = record.rflags;
                env.frame.rip = record.rip;
                env.frame.rsp = record.rsp;
                Ok(())
            }
            Err(err) => {
                let msg = format!("[{}] user panic in page fault handler: {}\n", self.env, err);
                self.harness.machine.output.push_str(&msg);
                log::warn!("[{}] page fault handler failed: {}", self.env, err);
                self.syscall(Syscall::EnvDestroy, [0; 5]);
                Err(SysError::Fault)
            }
        }
    }

    /// Translates `va` for a user access, taking page faults until it
    /// succeeds. Returns the frame number.
    fn touch(&mut self, va: u64, write: bool) -> Result<u64, SysError> {
        for _ in 0..MAX_FAULTS {
            self.resume()?;
            let env = self.harness.kernel.envs.get(self.env).ok_or(SysError::BadEnv)?;
            match env.space.translate(va, write, true) {
                Ok(pfn) => return Ok(pfn),
                Err(code) => {
                    self.harness.machine.cr2 = va;
                    self.raise(T_PGFLT, code.bits(), |_| {})?;
                }
            }
        }
        Err(SysError::Fault)
    }

    /// Loads bytes from user memory.
    pub fn read(&mut self, va: u64, buf: &mut [u8]) -> Result<(), SysError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done as u64;
            let offset = (addr % PGSIZE) as usize;
            let chunk = (PGSIZE as usize - offset).min(buf.len() - done);
            let pfn = self.touch(addr, false)?;
            let page = self.harness.kernel.memory.page(pfn).ok_or(SysError::Fault)?;
            buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Stores bytes to user memory.
    pub fn write(&mut self, va: u64, bytes: &[u8]) -> Result<(), SysError> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va + done as u64;
            let offset = (addr % PGSIZE) as usize;
            let chunk = (PGSIZE as usize - offset).min(bytes.len() - done);
            let pfn = self.touch(addr, true)?;
            let page = self.harness.kernel.memory.page_mut(pfn).ok_or(SysError::Fault)?;
            page[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Loads one byte.
    pub fn read_u8(&mut self, va: u64) -> Result<u8, SysError> {
        let mut byte = [0u8];
        self.read(va, &mut byte)?;
        Ok(byte[0])
    }

    /// Stores one byte.
    pub fn write_u8(&mut self, va: u64, value: u8) -> Result<(), SysError> {
        self.write(va, &[value])
    }

    /// Executes one instruction at the current instruction pointer.
    pub fn execute(&mut self, insn: Insn) -> Result<(), SysError> {
        let frame = self.resume()?;
        match insn {
            Insn::Int3 => self.raise(T_BRKPT, 0, |f| f.rip += INT3_LEN),
            Insn::Nop { len } if frame.single_step() => self.raise(T_DEBUG, 0, |f| f.rip += len),
            Insn::Nop { len } => {
                let env = self.harness.kernel.envs.get_mut(self.env).ok_or(SysError::BadEnv)?;
                env.frame.rip += len;
                Ok(())
            }
        }
    }
}

impl UserRuntime for UserProcess<'_> {
    fn syscall(&mut self, call: Syscall, args: [u64; 5]) -> i64 {
        // a child's first instruction is the return from the exofork that
        // created it
        if call == Syscall::Exofork && self.harness.fresh.remove(&self.env) {
            return match self.resume() {
                Ok(frame) => frame.regs.rax as i64,
                Err(err) => i64::from(err.code()),
            };
        }

        let [a1, a2, a3, a4, a5] = args;
        let raised = self.raise(T_SYSCALL, 0, |f| {
            f.regs.rax = call.number();
            f.regs.rdx = a1;
            f.regs.rcx = a2;
            f.regs.rbx = a3;
            f.regs.rdi = a4;
            f.regs.rsi = a5;
            f.rip += INT_LEN;
        });
        if let Err(err) = raised {
            return i64::from(err.code());
        }
        let Some(env) = self.harness.kernel.envs.get(self.env) else {
            return i64::from(SysError::BadEnv.code());
        };
        let ret = env.frame.regs.rax as i64;

        if call == Syscall::Exofork && ret > 0 {
            let child = EnvId::from_raw(ret as u32);
            let state = self.harness.user.get(&self.env).copied().unwrap_or_default();
            self.harness.user.insert(child, state);
            self.harness.fresh.insert(child);
        }
        ret
    }

    fn pte(&self, va: u64) -> Option<PageTableEntry> {
        self.harness.kernel.envs.get(self.env)?.space.lookup(va)
    }

    fn page_table_present(&self, va: u64) -> bool {
        self.harness
            .kernel
            .envs
            .get(self.env)
            .is_some_and(|env| env.space.page_table_present(va))
    }

    fn copy_page(&mut self, dst: u64, src: u64) -> Result<(), SysError> {
        let mut page = [0u8; PGSIZE as usize];
        self.read(src, &mut page)?;
        self.write(dst, &page)
    }

    fn this_env(&self) -> EnvId {
        self.harness.user.get(&self.env).map_or(EnvId::CURRENT, |state| state.this_env)
    }

    fn set_this_env(&mut self, id: EnvId) {
        self.harness.user.entry(self.env).or_default().this_env = id;
    }

    fn pgfault_handler(&self) -> Option<PgFaultHandler> {
        self.harness.user.get(&self.env).and_then(|state| state.handler)
    }

    fn set_pgfault_handler(&mut self, handler: PgFaultHandler) {
        self.harness.user.entry(self.env).or_default().handler = Some(handler);
    }
}
