//! A booted kernel with its CPUs, driven one trap at a time.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use skerry_common::memlayout::{PGSIZE, USTACKTOP, UTEXT};
use skerry_common::runtime::PgFaultHandler;
use skerry_common::{Access, EnvId, PageState, PageTableEntry, SysError};
use x86_64::VirtAddr;

use super::machine::HostMachine;
use super::process::UserProcess;
use crate::cpu::{CpuId, CpuState, CpuStatus, TrapContext};
use crate::sched::Transfer;
use crate::trap::frame::GD_KT;
use crate::trap::{init_percpu, vectors, CapturedFrame, TerminalAction};
use crate::Kernel;

/// Where the hosted vector table claims its entry stubs are.
pub const HOST_VECTORS: u64 = 0xFFFF_FFFF_8010_0000;

/// Instruction pointer of kernel-mode frames raised by the harness.
pub const KERNEL_RIP: u64 = 0xFFFF_FFFF_8020_1234;

/// Entry stub of `vector` in the hosted vector table.
pub fn host_trampoline(vector: u8) -> VirtAddr {
    VirtAddr::new(HOST_VECTORS + u64::from(vector) * 16)
}

/// Process-local state of one user program.
#[derive(Clone, Copy, Default)]
pub struct UserState {
    /// The program's idea of its own identity.
    pub this_env: EnvId,
    /// Installed page fault handler.
    pub handler: Option<PgFaultHandler>,
}

/// One trap as the harness saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRecord {
    /// CPU index.
    pub cpu: usize,
    /// Trap number.
    pub trapno: u64,
    /// What the dispatcher decided.
    pub action: TerminalAction,
    /// Where the CPU went.
    pub transfer: Transfer,
}

/// A kernel, its CPUs and the machine they share.
pub struct Harness {
    /// The kernel under test.
    pub kernel: Kernel,
    /// The hosted machine.
    pub machine: HostMachine,
    /// Per-CPU state, by index.
    pub cpus: Vec<CpuState>,
    /// User program state, by environment.
    pub user: BTreeMap<EnvId, UserState>,
    /// Children created by exofork that have not yet returned from it.
    pub fresh: BTreeSet<EnvId>,
    /// Record addresses of every page fault upcall, in order.
    pub upcalls: Vec<u64>,
    /// Every trap taken.
    pub traps: Vec<TrapRecord>,
}

impl Harness {
    /// Brings up `ncpu` CPUs, all idle with the kernel lock free.
    pub fn boot(ncpu: usize) -> Self {
        let table = vectors::init(host_trampoline);
        let mut machine = HostMachine::new();
        let mut cpus: Vec<CpuState> = (0..ncpu).map(|i| CpuState::new(CpuId::new(i as u8))).collect();
        for cpu in &mut cpus {
            init_percpu(cpu, &mut machine, table);
            cpu.status = CpuStatus::Halted;
        }
        Self {
            kernel: Kernel::new(),
            machine,
            cpus,
            user: BTreeMap::new(),
            fresh: BTreeSet::new(),
            upcalls: Vec::new(),
            traps: Vec::new(),
        }
    }

    /// Creates a runnable environment with a read-only text page at
    /// `UTEXT` and one writable stack page below `USTACKTOP`.
    pub fn spawn(&mut self) -> Result<EnvId, SysError> {
        let id = self.kernel.env_alloc(EnvId::CURRENT)?;
        for (va, access) in [(UTEXT, Access::ReadOnly), (USTACKTOP - PGSIZE, Access::ReadWrite)] {
            let pfn = self.kernel.memory.alloc_zeroed()?;
            let env = self.kernel.envs.get_mut(id).ok_or(SysError::BadEnv)?;
            env.space
                .insert(&mut self.kernel.memory, va, PageTableEntry::new(pfn, PageState::Private(access)));
        }
        self.user.insert(
            id,
            UserState {
                this_env: id,
                handler: None,
            },
        );
        Ok(id)
    }

    /// Runs the dispatcher on `cpu` and carries out its decision.
    pub fn trap(&mut self, cpu: usize, frame: CapturedFrame) -> Transfer {
        let mut cx = TrapContext::new(&mut self.cpus[cpu], &mut self.machine);
        let action = self.kernel.trap(&mut cx, &frame);
        let transfer = self.kernel.run(&mut cx, action);
        self.traps.push(TrapRecord {
            cpu,
            trapno: frame.trapno,
            action,
            transfer,
        });
        transfer
    }

    /// A trap taken while `cpu` runs kernel code.
    pub fn raise_kernel(&mut self, cpu: usize, trapno: u8, err: u64) -> Transfer {
        let frame = CapturedFrame {
            trapno: u64::from(trapno),
            err,
            rip: KERNEL_RIP,
            cs: u64::from(GD_KT),
            ..CapturedFrame::default()
        };
        self.trap(cpu, frame)
    }

    /// Hardware IRQ `irq` arriving on `cpu`, interrupting whatever it runs.
    pub fn interrupt(&mut self, cpu: usize, irq: u8) -> Transfer {
        let vector = skerry_common::trap::IRQ_OFFSET + irq;
        let running = self.cpus[cpu]
            .current
            .and_then(|cur| self.kernel.envs.get(cur))
            .map(|env| env.frame);
        match running {
            Some(mut frame) => {
                frame.trapno = u64::from(vector);
                frame.err = 0;
                self.trap(cpu, frame)
            }
            None => self.raise_kernel(cpu, vector, 0),
        }
    }

    /// Lets `cpu` pick something to run, as it does after boot.
    pub fn schedule(&mut self, cpu: usize) -> Transfer {
        let id = self.cpus[cpu].id();
        let mut cx = TrapContext::new(&mut self.cpus[cpu], &mut self.machine);
        if !self.kernel.lock().holding(id) {
            if let Err(err) = self.kernel.lock().acquire(id) {
                let action = self.kernel.fatal(&mut cx, format_args!("{}", err));
                return self.kernel.run(&mut cx, action);
            }
        }
        cx.cpu.status = CpuStatus::Started;
        self.kernel.run(&mut cx, TerminalAction::Yield)
    }

    /// User-mode view of `env`, running on CPU 0.
    pub fn process(&mut self, env: EnvId) -> UserProcess<'_> {
        UserProcess::new(self, 0, env)
    }

    /// User-mode view of `env`, running on `cpu`.
    pub fn process_on(&mut self, cpu: usize, env: EnvId) -> UserProcess<'_> {
        UserProcess::new(self, cpu, env)
    }

    /// Whether `env` still exists.
    pub fn alive(&self, env: EnvId) -> bool {
        self.kernel.envs.get(env).is_some()
    }
}
