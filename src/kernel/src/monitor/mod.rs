//! The interactive kernel monitor.
//!
//! Entered on breakpoint and single-step traps with the trapping frame, and
//! from the scheduler with no frame once nothing is left to run. Reads
//! commands from the console until one of them resumes the frame or the
//! console runs out of input.

pub mod backtrace;
pub mod commands;

use crate::config::monitor::{CMDBUF_SIZE, PROMPT};
use crate::cpu::CpuState;
use crate::trap::{print_trapframe, CapturedFrame};
use crate::{cprintln, Machine};

pub use backtrace::{Backtrace, StackFrame};
pub use commands::{Command, TooManyArgs};

/// Source location of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugInfo {
    /// Source file.
    pub file: &'static str,
    /// Line in `file`.
    pub line: u32,
    /// Enclosing function.
    pub fn_name: &'static str,
    /// Address of the enclosing function's first instruction.
    pub fn_addr: u64,
}

/// Link-time addresses of the kernel image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelLayout {
    /// Physical load address.
    pub start: u64,
    /// Entry point.
    pub entry: u64,
    /// End of code.
    pub etext: u64,
    /// End of initialized data.
    pub edata: u64,
    /// End of the image.
    pub end: u64,
}

/// What the monitor can see of the running kernel.
pub trait Introspect {
    /// The caller's frame pointer.
    fn frame_pointer(&self) -> u64;
    /// One machine word of kernel memory, if mapped.
    fn read_word(&self, addr: u64) -> Option<u64>;
    /// Source location of `rip`, when debug information covers it.
    fn resolve(&self, rip: u64) -> Option<DebugInfo>;
    /// Kernel image layout.
    fn kernel_layout(&self) -> KernelLayout;
}

/// How the monitor was left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// The monitor kept control until input ran out.
    Stay,
    /// A command asked to resume the frame.
    Resume,
}

/// Runs the monitor on this CPU.
pub fn run(machine: &mut dyn Machine, cpu: &CpuState, mut frame: Option<&mut CapturedFrame>) -> MonitorAction {
    cprintln!(machine, "Welcome to the Skerry kernel monitor!");
    cprintln!(machine, "Type 'help' for a list of commands.");
    if let Some(frame) = frame.as_deref() {
        print_trapframe(&mut *machine, cpu, frame);
    }

    loop {
        let mut buf = [0u8; CMDBUF_SIZE];
        let Some(line) = machine.read_line(PROMPT, &mut buf) else {
            log::debug!("CPU {}: monitor input closed", cpu.id());
            return MonitorAction::Stay;
        };
        let action = match Command::parse(line) {
            Ok(Some(cmd)) => cmd.execute(&mut *machine, cpu, frame.as_deref_mut()),
            Ok(None) => MonitorAction::Stay,
            Err(TooManyArgs) => {
                cprintln!(machine, "Too many arguments (max {})", crate::config::monitor::MAXARGS);
                MonitorAction::Stay
            }
        };
        if action == MonitorAction::Resume {
            return action;
        }
    }
}
