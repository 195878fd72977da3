//! The trap dispatcher.
//!
//! Every trap, from either privilege level, enters [`Kernel::trap`] with the
//! frame the entry stub captured. The dispatcher checks its entry
//! invariants, takes the kernel lock for traps from user mode, routes by
//! trap number and decides how the CPU continues. It never transfers
//! control itself; the returned [`TerminalAction`] is carried out by
//! [`Kernel::run`](crate::Kernel::run).

use skerry_common::{EnvId, EnvStatus};

use super::frame::{CapturedFrame, Origin};
use super::routes::{Flow, ROUTES};
use crate::cpu::{CpuStatus, TrapContext};
use crate::Kernel;

/// How a CPU leaves the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalAction {
    /// Return to this environment with its saved frame.
    Resume(EnvId),
    /// Let the scheduler pick what to run.
    Yield,
    /// Stop this CPU.
    Halt,
}

impl Kernel {
    /// Handles one trap on the CPU in `cx`.
    pub fn trap(&mut self, cx: &mut TrapContext<'_>, frame: &CapturedFrame) -> TerminalAction {
        // another CPU already stopped the system
        if self.is_panicked() {
            return TerminalAction::Halt;
        }

        // woken from the scheduler's idle state, which gave up the lock
        if cx.cpu.swap_status(CpuStatus::Started) == CpuStatus::Halted {
            if let Err(err) = self.lock().acquire(cx.cpu.id()) {
                return self.fatal(cx, format_args!("{}", err));
            }
        }

        if cx.machine.interrupts_enabled() {
            return self.fatal(cx, format_args!("interrupts enabled on trap entry"));
        }

        let origin = frame.origin();
        if origin == Origin::User {
            if !self.lock().holding(cx.cpu.id()) {
                if let Err(err) = self.lock().acquire(cx.cpu.id()) {
                    return self.fatal(cx, format_args!("{}", err));
                }
            }
            let Some(cur) = cx.cpu.current else {
                return self.fatal(cx, format_args!("trap from user mode with no current environment"));
            };
            let Some(env) = self.envs.get_mut(cur) else {
                return self.fatal(cx, format_args!("current environment {} does not exist", cur));
            };
            if env.status == EnvStatus::Dying {
                self.env_free(cx, cur);
                cx.cpu.current = None;
                return TerminalAction::Yield;
            }
            // from here on the environment's copy is the real one
            env.frame = *frame;
        }

        let mut working = *frame;
        cx.cpu.last_frame = Some(working);

        let handler = ROUTES.handler(working.trapno);
        let flow = handler(self, cx, &mut working);
        if origin == Origin::User {
            self.save_frame(cx, &working);
        }
        if let Flow::Terminal(action) = flow {
            return action;
        }

        match cx.cpu.current {
            Some(cur) if self.envs.get(cur).is_some_and(|env| env.status == EnvStatus::Running) => {
                TerminalAction::Resume(cur)
            }
            _ => TerminalAction::Yield,
        }
    }

    /// Writes the handled frame back into the current environment, if it
    /// survived the handler.
    fn save_frame(&mut self, cx: &TrapContext<'_>, frame: &CapturedFrame) {
        if let Some(env) = cx.cpu.current.and_then(|cur| self.envs.get_mut(cur)) {
            env.frame = *frame;
        }
    }
}
