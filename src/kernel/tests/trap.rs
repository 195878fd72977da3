//! Trap dispatch scenarios on the hosted machine.

use std::collections::VecDeque;

use skerry_common::memlayout::{PGFAULT_UPCALL, UTEXT};
use skerry_common::runtime::UserRuntime;
use skerry_common::syscall::Syscall;
use skerry_common::trap::{IRQ_KBD, IRQ_SPURIOUS, IRQ_TIMER, T_GPFLT, T_PGFLT, T_SYSCALL};
use skerry_common::{EnvId, EnvStatus, SysError};
use skerry_kernel::drivers::{BytePort, InputDevice, InputQueue};
use skerry_kernel::testutil::Harness;
use skerry_kernel::{TerminalAction, Transfer, TrapContext};

fn entered(transfer: Transfer) -> Option<EnvId> {
    match transfer {
        Transfer::Enter { env, .. } => Some(env),
        _ => None,
    }
}

#[test]
fn test_spurious_interrupt_keeps_saved_registers() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();
    let before = h.process(env).resume().unwrap();

    let transfer = h.interrupt(0, IRQ_SPURIOUS);

    let Transfer::Enter { env: resumed, frame } = transfer else {
        panic!("spurious interrupt did not resume: {transfer:?}");
    };
    assert_eq!(resumed, env);
    assert_eq!(frame.regs, before.regs);
    assert_eq!((frame.rip, frame.rsp, frame.rflags), (before.rip, before.rsp, before.rflags));
    assert_eq!((frame.cs, frame.ss), (before.cs, before.ss));
    assert!(h.machine.eoi.is_empty());
    assert!(!h.kernel.is_panicked());
    assert!(h.machine.take_output().contains("Spurious interrupt on irq 7"));
}

#[test]
fn test_timer_always_yields() {
    let mut h = Harness::boot(1);
    let a = h.spawn().unwrap();
    let b = h.spawn().unwrap();
    h.process(a).resume().unwrap();

    let transfer = h.interrupt(0, IRQ_TIMER);

    assert_eq!(entered(transfer), Some(b));
    assert_eq!(h.machine.eoi, vec![IRQ_TIMER]);
    assert_eq!(h.traps.last().map(|t| t.action), Some(TerminalAction::Yield));
    assert_eq!(h.kernel.envs.get(a).map(|e| e.status), Some(EnvStatus::Runnable));

    // the only other choice is the interrupted one
    assert_eq!(entered(h.interrupt(0, IRQ_TIMER)), Some(a));
}

#[test]
fn test_interrupts_enabled_on_entry_is_fatal() {
    let mut h = Harness::boot(1);
    h.machine.interrupts = true;

    assert_eq!(h.interrupt(0, IRQ_TIMER), Transfer::Stopped);
    assert!(h.kernel.is_panicked());
    assert_eq!(h.machine.halts, 1);
    assert!(h.machine.eoi.is_empty());
    assert!(h.machine.take_output().contains("interrupts enabled on trap entry"));
}

#[test]
fn test_kernel_page_fault_halts_every_cpu() {
    let mut h = Harness::boot(2);
    h.machine.cr2 = 0xdead;

    assert_eq!(h.raise_kernel(0, T_PGFLT, 0), Transfer::Stopped);
    let out = h.machine.take_output();
    assert!(out.contains("kernel fault va 0000dead"), "{out}");
    assert!(out.contains("cr2  0x000000000000dead"), "{out}");
    assert!(!out.contains("  rsp  "), "{out}");

    assert_eq!(h.interrupt(1, IRQ_TIMER), Transfer::Stopped);
    assert_eq!(h.traps.last().map(|t| t.action), Some(TerminalAction::Halt));
    assert_eq!(h.machine.halts, 2);
}

#[test]
fn test_unhandled_kernel_trap_is_fatal() {
    let mut h = Harness::boot(1);

    assert_eq!(h.raise_kernel(0, T_GPFLT, 0), Transfer::Stopped);
    assert!(h.kernel.is_panicked());
    assert!(h.machine.take_output().contains("unhandled trap in kernel"));
}

#[test]
fn test_unhandled_user_trap_destroys_only_that_env() {
    let mut h = Harness::boot(1);
    let a = h.spawn().unwrap();
    let b = h.spawn().unwrap();
    let mut frame = h.process(a).resume().unwrap();
    frame.trapno = u64::from(T_GPFLT);

    let transfer = h.trap(0, frame);

    assert!(!h.alive(a));
    assert!(h.alive(b));
    assert_eq!(entered(transfer), Some(b));
    assert!(!h.kernel.is_panicked());
    let out = h.machine.take_output();
    assert!(out.contains("trap 0x0000000d General Protection"), "{out}");
    assert!(out.contains("  rsp  0x"), "{out}");
    assert!(out.contains(&format!("free env {a}")), "{out}");
}

#[test]
fn test_page_fault_without_handler_destroys_env() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();

    assert!(h.process(env).write_u8(UTEXT, 1).is_err());

    assert!(!h.alive(env));
    let out = h.machine.take_output();
    assert!(out.contains(&format!("[{env}] user fault va 00400000 ip 00400000")), "{out}");
    assert!(out.contains("[user, write, protection]"), "{out}");
    // nothing left to run
    assert!(out.contains("No runnable environments in the system!"), "{out}");
}

#[test]
fn test_unwritable_exception_stack_destroys_env() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();
    let mut p = h.process(env);
    assert_eq!(p.syscall(Syscall::EnvSetPgfaultUpcall, [0, PGFAULT_UPCALL, 0, 0, 0]), 0);

    assert!(p.write_u8(UTEXT, 1).is_err());

    assert!(!h.alive(env));
    assert!(h.upcalls.is_empty());
    let out = h.machine.take_output();
    assert!(out.contains("user_mem_check assertion failure for va"), "{out}");
    assert!(out.contains("user fault va 00400000"), "{out}");
}

#[test]
fn test_dying_env_is_freed_on_its_next_trap() {
    let mut h = Harness::boot(2);
    let a = h.spawn().unwrap();
    let b = h.spawn().unwrap();
    h.process_on(1, b).resume().unwrap();

    {
        let mut cx = TrapContext::new(&mut h.cpus[0], &mut h.machine);
        h.kernel.env_destroy(&mut cx, b);
    }
    assert_eq!(h.kernel.envs.get(b).map(|e| e.status), Some(EnvStatus::Dying));

    let transfer = h.interrupt(1, IRQ_TIMER);

    assert!(!h.alive(b));
    assert_eq!(entered(transfer), Some(a));
    // reclaimed before any routing, so the timer was never acknowledged
    assert!(h.machine.eoi.is_empty());
}

#[test]
fn test_syscall_result_in_accumulator() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();

    let mut p = h.process(env);
    assert_eq!(p.syscall(Syscall::GetEnvId, [0; 5]), i64::from(env.as_raw()));
    assert_eq!(p.syscall(Syscall::PageUnmap, [0, 0x1001, 0, 0, 0]), i64::from(SysError::Invalid.code()));

    let mut frame = h.process(env).resume().unwrap();
    frame.trapno = u64::from(T_SYSCALL);
    frame.regs.rax = 99;
    h.trap(0, frame);
    let saved = h.kernel.envs.get(env).map(|e| e.frame.regs.rax);
    assert_eq!(saved, Some(SysError::Invalid.code() as i64 as u64));
}

#[test]
fn test_yield_syscall_switches_env() {
    let mut h = Harness::boot(1);
    let a = h.spawn().unwrap();
    let b = h.spawn().unwrap();

    assert_eq!(h.process(a).syscall(Syscall::Yield, [0; 5]), 0);

    assert_eq!(h.cpus[0].current, Some(b));
    assert_eq!(h.traps.last().map(|t| t.action), Some(TerminalAction::Yield));
}

#[test]
fn test_cputs_prints_user_memory() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();
    let stack = skerry_common::memlayout::USTACKTOP - 64;

    let mut p = h.process(env);
    p.write(stack, b"hello, trap").unwrap();
    assert_eq!(p.syscall(Syscall::Cputs, [stack, 11, 0, 0, 0]), 0);
    assert!(h.machine.take_output().contains("hello, trap"));

    // an unmapped buffer kills the caller
    let mut p = h.process(env);
    assert!(p.syscall(Syscall::Cputs, [0x1000, 4, 0, 0, 0]) < 0);
    assert!(!h.alive(env));
}

static PORT_QUEUE: InputQueue = InputQueue::new("test");

struct Scripted(VecDeque<u8>);

impl BytePort for Scripted {
    fn read_byte(&mut self) -> Option<u8> {
        self.0.pop_front()
    }
}

#[test]
fn test_device_interrupt_feeds_driver_and_resumes() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();
    let port = Scripted(VecDeque::from([0x1c, 0x9c]));
    h.machine.attach(IRQ_KBD, Box::new(InputDevice::new(port, &PORT_QUEUE)));
    h.process(env).resume().unwrap();

    assert_eq!(entered(h.interrupt(0, IRQ_KBD)), Some(env));

    assert_eq!(h.machine.eoi, vec![IRQ_KBD]);
    assert_eq!(PORT_QUEUE.pop(), Some(0x1c));
    assert_eq!(PORT_QUEUE.pop(), Some(0x9c));
    assert_eq!(PORT_QUEUE.pop(), None);
}

#[test]
fn test_idle_cpu_reacquires_lock_on_wakeup() {
    let mut h = Harness::boot(2);
    let env = h.spawn().unwrap();
    h.process(env).resume().unwrap();

    // CPU 1 finds nothing runnable and idles with the lock released
    assert_eq!(h.schedule(1), Transfer::Idle);
    assert!(!h.kernel.lock().holding(h.cpus[1].id()));

    assert_eq!(h.interrupt(1, IRQ_TIMER), Transfer::Idle);
    assert_eq!(h.machine.eoi, vec![IRQ_TIMER]);
    assert!(!h.kernel.is_panicked());
}
