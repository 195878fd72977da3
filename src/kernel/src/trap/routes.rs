//! Trap number to handler mapping.
//!
//! Built once, on first use. Every vector without a dedicated handler
//! routes to [`unhandled`].

use lazy_static::lazy_static;
use skerry_common::syscall::Syscall;
use skerry_common::trap::{
    IRQ_KBD, IRQ_OFFSET, IRQ_SERIAL, IRQ_SPURIOUS, IRQ_TIMER, T_BRKPT, T_DEBUG, T_PGFLT, T_SYSCALL,
};

use super::dispatch::TerminalAction;
use super::frame::{print_trapframe, CapturedFrame, Origin};
use super::vectors::NVECTORS;
use crate::cpu::TrapContext;
use crate::monitor::{self, MonitorAction};
use crate::{cprintln, Kernel};

/// What the dispatcher does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Resume the current environment if it is still running, else yield.
    Continue,
    /// Skip the normal epilogue and take this action.
    Terminal(TerminalAction),
}

/// A trap handler. Works on the dispatcher's copy of the frame.
pub type TrapHandler = fn(&mut Kernel, &mut TrapContext<'_>, &mut CapturedFrame) -> Flow;

/// Handler per vector.
pub struct TrapRoutes {
    handlers: [TrapHandler; NVECTORS],
}

impl TrapRoutes {
    fn new() -> Self {
        let mut handlers: [TrapHandler; NVECTORS] = [unhandled as TrapHandler; NVECTORS];
        handlers[usize::from(IRQ_OFFSET + IRQ_SPURIOUS)] = spurious;
        handlers[usize::from(IRQ_OFFSET + IRQ_TIMER)] = timer;
        handlers[usize::from(IRQ_OFFSET + IRQ_KBD)] = device;
        handlers[usize::from(IRQ_OFFSET + IRQ_SERIAL)] = device;
        handlers[usize::from(T_PGFLT)] = super::page_fault::page_fault;
        handlers[usize::from(T_BRKPT)] = breakpoint;
        handlers[usize::from(T_DEBUG)] = breakpoint;
        handlers[usize::from(T_SYSCALL)] = syscall;
        Self { handlers }
    }

    /// Handler for trap number `trapno`.
    pub fn handler(&self, trapno: u64) -> TrapHandler {
        usize::try_from(trapno)
            .ok()
            .and_then(|n| self.handlers.get(n))
            .copied()
            .unwrap_or(unhandled)
    }
}

lazy_static! {
    /// The trap routing table.
    pub static ref ROUTES: TrapRoutes = TrapRoutes::new();
}

/// Noise on IRQ 7. Reported and otherwise ignored.
fn spurious(_kernel: &mut Kernel, cx: &mut TrapContext<'_>, frame: &mut CapturedFrame) -> Flow {
    log::warn!("spurious interrupt on irq {} (CPU {})", IRQ_SPURIOUS, cx.cpu.id());
    cprintln!(cx.machine, "Spurious interrupt on irq {}", IRQ_SPURIOUS);
    print_trapframe(cx.machine, cx.cpu, frame);
    Flow::Continue
}

/// Preemption. Never resumes the interrupted frame directly.
fn timer(_kernel: &mut Kernel, cx: &mut TrapContext<'_>, _frame: &mut CapturedFrame) -> Flow {
    cx.machine.end_of_interrupt(IRQ_TIMER);
    Flow::Terminal(TerminalAction::Yield)
}

/// Keyboard and serial input.
fn device(_kernel: &mut Kernel, cx: &mut TrapContext<'_>, frame: &mut CapturedFrame) -> Flow {
    let irq = (frame.trapno - u64::from(IRQ_OFFSET)) as u8;
    match cx.machine.device(irq) {
        Some(device) => device.handle_interrupt(),
        None => log::warn!("irq {} has no driver", irq),
    }
    cx.machine.end_of_interrupt(irq);
    Flow::Continue
}

/// Breakpoint and single-step traps enter the monitor.
fn breakpoint(_kernel: &mut Kernel, cx: &mut TrapContext<'_>, frame: &mut CapturedFrame) -> Flow {
    match monitor::run(cx.machine, cx.cpu, Some(frame)) {
        MonitorAction::Resume => Flow::Continue,
        // the console went away with the monitor still in charge
        MonitorAction::Stay => Flow::Terminal(TerminalAction::Halt),
    }
}

/// System call: number in `rax`, arguments in `rdx`, `rcx`, `rbx`, `rdi`,
/// `rsi`, result back into `rax`.
fn syscall(kernel: &mut Kernel, cx: &mut TrapContext<'_>, frame: &mut CapturedFrame) -> Flow {
    let regs = &frame.regs;
    let args = [regs.rdx, regs.rcx, regs.rbx, regs.rdi, regs.rsi];
    let ret = match Syscall::try_from(regs.rax) {
        Ok(Syscall::Yield) => {
            frame.regs.rax = 0;
            return Flow::Terminal(TerminalAction::Yield);
        }
        Ok(call) => kernel.syscall(cx, call, args),
        Err(err) => {
            log::debug!("unknown syscall {}", regs.rax);
            Err(err)
        }
    };
    frame.regs.rax = match ret {
        Ok(value) => value,
        Err(err) => i64::from(err.code()) as u64,
    };
    Flow::Continue
}

/// Anything else: a bug in the kernel or in the user program.
pub fn unhandled(kernel: &mut Kernel, cx: &mut TrapContext<'_>, frame: &mut CapturedFrame) -> Flow {
    print_trapframe(cx.machine, cx.cpu, frame);
    if frame.origin() == Origin::Kernel {
        return Flow::Terminal(kernel.fatal(cx, format_args!("unhandled trap in kernel")));
    }
    match cx.cpu.current {
        Some(cur) => {
            log::warn!("[{}] unhandled trap {}, destroying", cur, frame.trapno);
            kernel.env_destroy(cx, cur);
        }
        None => return Flow::Terminal(kernel.fatal(cx, format_args!("user trap with no environment"))),
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_vectors_default_to_unhandled() {
        let h = ROUTES.handler(200) as usize;
        assert_eq!(h, unhandled as TrapHandler as usize);
        assert_eq!(ROUTES.handler(u64::MAX) as usize, unhandled as TrapHandler as usize);
        assert_ne!(ROUTES.handler(u64::from(T_PGFLT)) as usize, unhandled as TrapHandler as usize);
    }
}
