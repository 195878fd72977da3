//! Page fault handling and delivery to user fault handlers.
//!
//! A kernel-mode page fault is always fatal. A user-mode fault is handed to
//! the environment's registered upcall by writing a [`UserFaultRecord`] onto
//! its exception stack; without an upcall, or when the record cannot be
//! written, the environment is destroyed.

use skerry_common::memlayout::{in_exception_stack, PGSIZE, UXSTACKTOP, WORD_SIZE};
use skerry_common::{EnvId, PteFlags, UserFaultRecord};

use super::dispatch::TerminalAction;
use super::frame::{print_trapframe, CapturedFrame, Origin};
use super::routes::Flow;
use crate::cpu::TrapContext;
use crate::{cprintln, Kernel};

/// Where the fault record for a trap at `rsp` goes.
///
/// A fault taken while already running on the exception stack is nested:
/// the new record goes below the active one, leaving one word of scratch
/// space for the handler's return path.
pub fn record_address(rsp: u64) -> u64 {
    if in_exception_stack(rsp) {
        rsp - UserFaultRecord::SIZE - WORD_SIZE
    } else {
        UXSTACKTOP - UserFaultRecord::SIZE
    }
}

/// Route for `T_PGFLT`.
pub(super) fn page_fault(kernel: &mut Kernel, cx: &mut TrapContext<'_>, frame: &mut CapturedFrame) -> Flow {
    let fault_va = cx.machine.fault_address();

    if frame.origin() == Origin::Kernel {
        print_trapframe(cx.machine, cx.cpu, frame);
        return Flow::Terminal(kernel.fatal(cx, format_args!("kernel fault va {:08x}", fault_va)));
    }

    let Some(cur) = cx.cpu.current else {
        return Flow::Terminal(kernel.fatal(cx, format_args!("user page fault with no environment")));
    };
    let upcall = kernel.envs.get(cur).and_then(|env| env.pgfault_upcall);

    if let Some(upcall) = upcall {
        match kernel.deliver_fault(cur, frame, fault_va) {
            Ok(record_va) => {
                log::debug!("[{}] fault va {:#x} delivered at {:#x}", cur, fault_va, record_va);
                frame.rip = upcall;
                frame.rsp = record_va;
                return Flow::Terminal(TerminalAction::Resume(cur));
            }
            Err(bad_va) => {
                cprintln!(cx.machine, "[{}] user_mem_check assertion failure for va {:08x}", cur, bad_va);
            }
        }
    }

    cprintln!(cx.machine, "[{}] user fault va {:08x} ip {:08x}", cur, fault_va, frame.rip);
    log::warn!("[{}] user fault va {:#x} ip {:#x}, destroying", cur, fault_va, frame.rip);
    print_trapframe(cx.machine, cx.cpu, frame);
    kernel.env_destroy(cx, cur);
    Flow::Continue
}

impl Kernel {
    /// Writes the fault record for `frame` onto `id`'s exception stack.
    ///
    /// Nothing is written unless the whole record fits in the exception
    /// stack and the environment may write there. Returns the record's
    /// address, or the first address that failed the check.
    pub fn deliver_fault(&mut self, id: EnvId, frame: &CapturedFrame, fault_va: u64) -> Result<u64, u64> {
        let record_va = record_address(frame.rsp);
        if record_va < UXSTACKTOP - PGSIZE {
            // exception stack overflow
            return Err(record_va);
        }
        let env = self.envs.get(id).ok_or(record_va)?;
        env.space
            .check_user(record_va, UserFaultRecord::SIZE, PteFlags::WRITABLE)?;

        let record = frame.fault_record(fault_va);
        env.space.write(&mut self.memory, record_va, &record.to_bytes())?;
        Ok(record_va)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_record_sits_at_top_of_exception_stack() {
        let normal_stack = UXSTACKTOP - 3 * PGSIZE;
        assert_eq!(record_address(normal_stack), UXSTACKTOP - UserFaultRecord::SIZE);
    }

    #[test]
    fn test_nested_record_leaves_one_word_gap() {
        let first = record_address(0xeebf_d000);
        let second = record_address(first);
        assert_eq!(first - second, UserFaultRecord::SIZE + WORD_SIZE);
    }
}
