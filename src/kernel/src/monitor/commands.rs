//! Built-in monitor commands.

use skerry_common::memlayout::KERNBASE;

use super::backtrace::Backtrace;
use super::{DebugInfo, MonitorAction};
use crate::config::monitor::MAXARGS;
use crate::cpu::CpuState;
use crate::trap::CapturedFrame;
use crate::{cprint, cprintln, Machine};

const WHITESPACE: &[char] = &[' ', '\t', '\r', '\n'];

/// Name and one-line description of every command, in `help` order.
pub const COMMANDS: [(&str, &str); 5] = [
    ("help", "Display this list of commands"),
    ("kerninfo", "Display information about the kernel"),
    ("backtrace", "Display a stack backtrace"),
    ("continue", "Continue execution from the current trap"),
    ("stepi", "Execute one instruction and trap again"),
];

/// A parsed command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// List the commands.
    Help,
    /// Kernel section addresses and footprint.
    Kerninfo,
    /// Walk the frame-pointer chain.
    Backtrace,
    /// Resume with single-stepping off.
    Continue,
    /// Resume for one instruction.
    Stepi,
    /// Anything else.
    Unknown(&'a str),
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyArgs;

impl<'a> Command<'a> {
    /// Parses one input line. Blank lines parse to `None`.
    ///
    /// Arguments after the command name are accepted and ignored; no command
    /// takes any.
    pub fn parse(line: &'a str) -> Result<Option<Command<'a>>, TooManyArgs> {
        let mut words = line.split(WHITESPACE).filter(|w| !w.is_empty());
        if words.clone().count() > MAXARGS - 1 {
            return Err(TooManyArgs);
        }
        let Some(name) = words.next() else {
            return Ok(None);
        };
        Ok(Some(match name {
            "help" => Command::Help,
            "kerninfo" => Command::Kerninfo,
            "backtrace" => Command::Backtrace,
            "continue" => Command::Continue,
            "stepi" => Command::Stepi,
            other => Command::Unknown(other),
        }))
    }

    /// Runs the command.
    pub fn execute(
        self,
        machine: &mut dyn Machine,
        cpu: &CpuState,
        frame: Option<&mut CapturedFrame>,
    ) -> MonitorAction {
        match self {
            Command::Help => cmd_help(machine),
            Command::Kerninfo => cmd_kerninfo(machine),
            Command::Backtrace => cmd_backtrace(machine, cpu, frame.as_deref()),
            Command::Continue => return cmd_continue(machine, frame),
            Command::Stepi => return cmd_stepi(machine, frame),
            Command::Unknown(name) => cprintln!(machine, "Unknown command '{}'", name),
        }
        MonitorAction::Stay
    }
}

fn cmd_help(machine: &mut dyn Machine) {
    for (name, desc) in COMMANDS {
        cprintln!(machine, "{} - {}", name, desc);
    }
}

fn cmd_kerninfo(machine: &mut dyn Machine) {
    let layout = machine.kernel_layout();
    let phys = |virt: u64| virt.wrapping_sub(KERNBASE);

    cprintln!(machine, "Special kernel symbols:");
    cprintln!(machine, "  _start                  {:016x} (phys)", layout.start);
    for (name, virt) in [
        ("entry", layout.entry),
        ("etext", layout.etext),
        ("edata", layout.edata),
        ("end  ", layout.end),
    ] {
        cprintln!(machine, "  {}  {:016x} (virt)  {:016x} (phys)", name, virt, phys(virt));
    }
    let footprint = layout.end.saturating_sub(layout.entry).div_ceil(1024);
    cprintln!(machine, "Kernel executable memory footprint: {}KB", footprint);
}

fn cmd_backtrace(machine: &mut dyn Machine, cpu: &CpuState, frame: Option<&CapturedFrame>) {
    cprintln!(machine, "Stack backtrace:");
    let sentinel = frame.map(|f| f.rsp);
    let mut walk = Backtrace::new(machine.frame_pointer(), sentinel);
    while let Some(f) = walk.step(&*machine) {
        let [a0, a1, a2, a3, a4] = f.args;
        cprintln!(
            machine,
            "  rbp {:016x}  rip {:016x}  args {:016x} {:016x} {:016x} {:016x} {:016x}",
            f.fp,
            f.rip,
            a0,
            a1,
            a2,
            a3,
            a4
        );
        cprint!(machine, "\t");
        print_location(machine, f.rip);
    }
    log::debug!("CPU {}: backtrace done", cpu.id());
}

fn cmd_continue(machine: &mut dyn Machine, frame: Option<&mut CapturedFrame>) -> MonitorAction {
    let Some(frame) = frame else {
        cprintln!(machine, "continue: not entered from a trap");
        return MonitorAction::Stay;
    };
    frame.set_single_step(false);
    MonitorAction::Resume
}

fn cmd_stepi(machine: &mut dyn Machine, frame: Option<&mut CapturedFrame>) -> MonitorAction {
    let Some(frame) = frame else {
        cprintln!(machine, "stepi: not entered from a trap");
        return MonitorAction::Stay;
    };
    print_location(machine, frame.rip);
    frame.set_single_step(true);
    MonitorAction::Resume
}

/// Prints `file:line: fn+offset` for `rip`, or just ends the line.
fn print_location(machine: &mut dyn Machine, rip: u64) {
    match machine.resolve(rip) {
        Some(DebugInfo {
            file,
            line,
            fn_name,
            fn_addr,
        }) => cprintln!(machine, "{}:{}: {}+{}", file, line, fn_name, rip.wrapping_sub(fn_addr)),
        None => cprintln!(machine),
    }
}
