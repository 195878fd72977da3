//! The runner: carries out the dispatcher's terminal action.
//!
//! Scheduling is round-robin over the environment table, starting after the
//! environment this CPU ran last. A CPU with nothing to run gives up the
//! kernel lock and idles until its next interrupt.

use skerry_common::env::NENV;
use skerry_common::{EnvId, EnvStatus};

use crate::cpu::{CpuStatus, TrapContext};
use crate::monitor;
use crate::trap::{CapturedFrame, TerminalAction};
use crate::{cprintln, Kernel};

/// Where a CPU goes after leaving the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Enter user mode in `env` with `frame`.
    Enter {
        /// The environment now running on this CPU.
        env: EnvId,
        /// Registers to restore.
        frame: CapturedFrame,
    },
    /// Wait for an interrupt with the kernel lock released.
    Idle,
    /// The CPU is stopped for good.
    Stopped,
}

impl Kernel {
    /// Carries out `action` on the CPU in `cx`.
    pub fn run(&mut self, cx: &mut TrapContext<'_>, action: TerminalAction) -> Transfer {
        match action {
            TerminalAction::Resume(id) => self.env_run(cx, id),
            TerminalAction::Yield => self.sched_yield(cx),
            TerminalAction::Halt => {
                cx.machine.halt();
                Transfer::Stopped
            }
        }
    }

    /// Switches this CPU to `id` and releases the kernel lock.
    pub fn env_run(&mut self, cx: &mut TrapContext<'_>, id: EnvId) -> Transfer {
        if let Some(prev) = cx.cpu.current.and_then(|prev| self.envs.get_mut(prev)) {
            if prev.status == EnvStatus::Running {
                prev.status = EnvStatus::Runnable;
            }
        }

        let Some(env) = self.envs.get_mut(id) else {
            let action = self.fatal(cx, format_args!("env_run: no environment {}", id));
            return self.run(cx, action);
        };
        env.status = EnvStatus::Running;
        env.runs += 1;
        env.cpu = Some(cx.cpu.id());
        let frame = env.frame;
        cx.cpu.current = Some(id);

        if let Err(err) = self.lock().release(cx.cpu.id()) {
            let action = self.fatal(cx, format_args!("{}", err));
            return self.run(cx, action);
        }
        log::trace!("CPU {} enters {}", cx.cpu.id(), id);
        Transfer::Enter { env: id, frame }
    }

    /// Picks the next environment to run on this CPU.
    pub fn sched_yield(&mut self, cx: &mut TrapContext<'_>) -> Transfer {
        let start = cx.cpu.current.map_or(0, |cur| cur.slot() + 1);
        let next = (0..NENV)
            .map(|i| (start + i) % NENV)
            .filter_map(|slot| self.envs.at_slot(slot))
            .find(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id);
        if let Some(next) = next {
            return self.env_run(cx, next);
        }

        let this_cpu = Some(cx.cpu.id());
        if let Some(cur) = cx.cpu.current {
            let still_mine = self
                .envs
                .get(cur)
                .is_some_and(|env| env.status == EnvStatus::Running && env.cpu == this_cpu);
            if still_mine {
                return self.env_run(cx, cur);
            }
        }
        self.sched_halt(cx)
    }

    /// Idles this CPU.
    ///
    /// With no environment left anywhere, the CPU drops into the monitor
    /// instead and never leaves it.
    pub fn sched_halt(&mut self, cx: &mut TrapContext<'_>) -> Transfer {
        let any_alive = self.envs.iter().any(|env| {
            matches!(
                env.status,
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
            )
        });
        if !any_alive {
            cprintln!(cx.machine, "No runnable environments in the system!");
            log::info!("CPU {}: no runnable environments", cx.cpu.id());
            monitor::run(cx.machine, cx.cpu, None);
            return Transfer::Stopped;
        }

        cx.cpu.current = None;
        cx.cpu.status = CpuStatus::Halted;
        if let Err(err) = self.lock().release(cx.cpu.id()) {
            let action = self.fatal(cx, format_args!("{}", err));
            return self.run(cx, action);
        }
        log::trace!("CPU {} idle", cx.cpu.id());
        Transfer::Idle
    }
}
