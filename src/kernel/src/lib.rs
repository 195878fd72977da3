//! Skerry Kernel
//!
//! The trap and exception layer of a small multiprocessor kernel, together
//! with the pieces it needs to run user environments: an environment table,
//! a round-robin scheduler, the syscall relay and software page tables.
//!
//! # Architecture
//!
//! The kernel is structured into the following modules:
//! - `trap`: vector table, trap dispatcher and page-fault delivery
//! - `env`: environments and the environment table
//! - `sched`: the runner that turns a terminal action into a CPU transfer
//! - `syscall`: the system call relay
//! - `memory`: physical frame pool and per-environment address spaces
//! - `monitor`: the interactive kernel monitor entered on breakpoints
//! - `sync`: the big kernel lock
//! - `drivers`: interrupt-driven input queues
//! - `arch`: bare-metal x86_64 glue (serial, PIC, trap entry stubs)
//!
//! Hardware is reached only through the [`Machine`] trait, so everything
//! above `arch` also runs hosted; see [`testutil`].
//!
//! # Safety
//!
//! Outside of `arch` the kernel contains no unsafe code. All unsafe code in
//! `arch` is documented with the invariants it relies on.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod allocator;
pub mod arch;
pub mod config;
pub mod console;
pub mod cpu;
pub mod drivers;
pub mod env;
pub mod logger;
pub mod memory;
pub mod monitor;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod testutil;
pub mod trap;

use core::sync::atomic::{AtomicBool, Ordering};

use skerry_hal::{Console, InterruptController, IrqDevice, Processor};

use crate::env::EnvTable;
use crate::memory::PhysMemory;
use crate::monitor::Introspect;
use crate::sync::BigKernelLock;

pub use crate::cpu::{CpuId, CpuState, CpuStatus, TrapContext};
pub use crate::sched::Transfer;
pub use crate::trap::{CapturedFrame, TerminalAction};

/// Initializes boot-time services on bare metal: COM1, the logger, the
/// heap, the descriptor table and the interrupt controllers.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    arch::x86_64::serial::init();
    if logger::init_default(arch::x86_64::serial::_print).is_err() {
        serial_println!("logger already installed");
    }
    allocator::init_heap();
    arch::x86_64::gdt::init();
    arch::x86_64::pic::init();
}

/// Everything the kernel needs from the machine it runs on.
pub trait Machine: Processor + InterruptController + Console + Introspect {
    /// The driver servicing hardware IRQ line `irq`, if any.
    fn device(&mut self, irq: u8) -> Option<&mut dyn IrqDevice>;
}

/// Kernel-wide state shared by all CPUs.
///
/// Every CPU that enters the kernel from user mode holds the big kernel
/// lock while it works on this state.
pub struct Kernel {
    /// All environments.
    pub envs: EnvTable,
    /// Physical page frames backing user memory.
    pub memory: PhysMemory,
    lock: BigKernelLock,
    panicked: AtomicBool,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Create a kernel with no environments and an empty frame pool.
    pub fn new() -> Self {
        Self {
            envs: EnvTable::new(),
            memory: PhysMemory::new(config::memory::NFRAMES),
            lock: BigKernelLock::new(),
            panicked: AtomicBool::new(false),
        }
    }

    /// The big kernel lock.
    pub fn lock(&self) -> &BigKernelLock {
        &self.lock
    }

    /// Whether some CPU stopped the system on a fatal error.
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Stops the whole system.
    ///
    /// Prints `msg`, marks the system panicked so that every other CPU halts
    /// on its next trap, and returns the action that halts this one.
    pub fn fatal(&self, cx: &mut TrapContext<'_>, msg: core::fmt::Arguments<'_>) -> TerminalAction {
        cprintln!(cx.machine, "kernel panic on CPU {}: {}", cx.cpu.id(), msg);
        log::error!("kernel panic on CPU {}: {}", cx.cpu.id(), msg);
        self.panicked.store(true, Ordering::Release);
        TerminalAction::Halt
    }
}
