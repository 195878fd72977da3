//! The register frame captured on every trap, and how it is printed.

use skerry_common::trap::{FaultCode, PushRegs, UserFaultRecord, IRQ_OFFSET, NIRQS, T_PGFLT, T_SYSCALL};
use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::cpu::CpuState;
use crate::{cprint, cprintln, Machine};

/// Kernel code segment selector.
pub const GD_KT: u16 = 0x08;
/// Kernel data segment selector.
pub const GD_KD: u16 = 0x10;
/// User code segment selector, RPL 3.
pub const GD_UT: u16 = 0x18 | 3;
/// User data segment selector, RPL 3.
pub const GD_UD: u16 = 0x20 | 3;
/// Task state segment selector. Every CPU has its own descriptor table
/// holding its own TSS at this slot.
pub const GD_TSS0: u16 = 0x28;

/// Privilege level a trap came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Ring 0.
    Kernel,
    /// Ring 3.
    User,
}

/// Machine state at a trap, in the order the entry stubs push it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturedFrame {
    /// General registers.
    pub regs: PushRegs,
    /// Vector number.
    pub trapno: u64,
    /// Hardware error code, or zero.
    pub err: u64,
    /// Interrupted instruction.
    pub rip: u64,
    /// Code segment selector.
    pub cs: u64,
    /// Flags register.
    pub rflags: u64,
    /// Interrupted stack pointer.
    pub rsp: u64,
    /// Stack segment selector.
    pub ss: u64,
}

impl CapturedFrame {
    /// Initial frame of a user environment: user segments, interrupts on.
    pub fn user(rip: u64, rsp: u64) -> Self {
        Self {
            rip,
            rsp,
            cs: u64::from(GD_UT),
            ss: u64::from(GD_UD),
            rflags: RFlags::INTERRUPT_FLAG.bits(),
            ..Self::default()
        }
    }

    /// Privilege level of the interrupted code.
    pub fn origin(&self) -> Origin {
        match SegmentSelector(self.cs as u16).rpl() {
            PrivilegeLevel::Ring3 => Origin::User,
            _ => Origin::Kernel,
        }
    }

    /// Flags register.
    pub fn flags(&self) -> RFlags {
        RFlags::from_bits_truncate(self.rflags)
    }

    /// Whether the interrupted code had interrupts enabled.
    pub fn interrupts_enabled(&self) -> bool {
        self.flags().contains(RFlags::INTERRUPT_FLAG)
    }

    /// Whether single-stepping is armed.
    pub fn single_step(&self) -> bool {
        self.flags().contains(RFlags::TRAP_FLAG)
    }

    /// Arms or disarms single-stepping.
    pub fn set_single_step(&mut self, on: bool) {
        let mut flags = self.flags();
        flags.set(RFlags::TRAP_FLAG, on);
        self.rflags = flags.bits();
    }

    /// The record delivered to a user fault handler for a fault at
    /// `fault_va`. Its error word carries the trap number.
    pub fn fault_record(&self, fault_va: u64) -> UserFaultRecord {
        UserFaultRecord {
            fault_va,
            err: self.trapno,
            regs: self.regs,
            rflags: self.rflags,
            rip: self.rip,
            rsp: self.rsp,
        }
    }
}

/// Human-readable name of a trap number.
pub fn trapname(trapno: u64) -> &'static str {
    const EXCNAMES: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];

    let irqs = u64::from(IRQ_OFFSET)..u64::from(IRQ_OFFSET + NIRQS);
    match trapno {
        n if (n as usize) < EXCNAMES.len() => EXCNAMES[n as usize],
        n if n == u64::from(T_SYSCALL) => "System call",
        n if irqs.contains(&n) => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

/// Prints every field of `frame`.
///
/// CR2 is shown only when `frame` is the page fault this CPU is handling
/// right now, and the stack pointer only for frames from user mode.
pub fn print_trapframe<M: Machine + ?Sized>(machine: &mut M, cpu: &CpuState, frame: &CapturedFrame) {
    cprintln!(machine, "TRAP frame at {:p} from CPU {}", frame, cpu.id());
    print_regs(machine, &frame.regs);
    cprintln!(machine, "  trap 0x{:08x} {}", frame.trapno, trapname(frame.trapno));
    if cpu.last_frame.as_ref() == Some(frame) && frame.trapno == u64::from(T_PGFLT) {
        let cr2 = machine.fault_address();
        cprintln!(machine, "  cr2  0x{:016x}", cr2);
    }
    cprint!(machine, "  err  0x{:08x}", frame.err);
    if frame.trapno == u64::from(T_PGFLT) {
        let code = FaultCode::from_bits_truncate(frame.err);
        cprintln!(
            machine,
            " [{}, {}, {}]",
            if code.contains(FaultCode::USER) { "user" } else { "kernel" },
            if code.contains(FaultCode::WRITE) { "write" } else { "read" },
            if code.contains(FaultCode::PROTECTION) { "protection" } else { "not-present" },
        );
    } else {
        cprintln!(machine);
    }
    cprintln!(machine, "  rip  0x{:016x}", frame.rip);
    cprintln!(machine, "  cs   0x----{:04x}", frame.cs);
    cprintln!(machine, "  flag 0x{:08x}", frame.rflags);
    if frame.origin() == Origin::User {
        cprintln!(machine, "  rsp  0x{:016x}", frame.rsp);
        cprintln!(machine, "  ss   0x----{:04x}", frame.ss);
    }
}

/// Prints the general registers.
pub fn print_regs<M: Machine + ?Sized>(machine: &mut M, regs: &PushRegs) {
    let named = [
        ("r15", regs.r15),
        ("r14", regs.r14),
        ("r13", regs.r13),
        ("r12", regs.r12),
        ("r11", regs.r11),
        ("r10", regs.r10),
        ("r9", regs.r9),
        ("r8", regs.r8),
        ("rdi", regs.rdi),
        ("rsi", regs.rsi),
        ("rbp", regs.rbp),
        ("rbx", regs.rbx),
        ("rdx", regs.rdx),
        ("rcx", regs.rcx),
        ("rax", regs.rax),
    ];
    for (name, value) in named {
        cprintln!(machine, "  {:<4} 0x{:016x}", name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skerry_common::trap::{T_BRKPT, T_DIVIDE, T_SIMDERR};

    #[test]
    fn test_origin_follows_code_segment_rpl() {
        let user = CapturedFrame::user(0x80_0000, 0xeebf_e000);
        assert_eq!(user.origin(), Origin::User);

        let kernel = CapturedFrame {
            cs: u64::from(GD_KT),
            ..CapturedFrame::default()
        };
        assert_eq!(kernel.origin(), Origin::Kernel);
    }

    #[test]
    fn test_single_step_toggle_keeps_other_flags() {
        let mut frame = CapturedFrame::user(0, 0);
        frame.set_single_step(true);
        assert!(frame.single_step());
        assert!(frame.interrupts_enabled());
        frame.set_single_step(false);
        assert!(!frame.single_step());
        assert_eq!(frame.rflags, RFlags::INTERRUPT_FLAG.bits());
    }

    #[test]
    fn test_trapnames() {
        assert_eq!(trapname(u64::from(T_DIVIDE)), "Divide error");
        assert_eq!(trapname(u64::from(T_BRKPT)), "Breakpoint");
        assert_eq!(trapname(u64::from(T_SIMDERR)), "SIMD Floating-Point Exception");
        assert_eq!(trapname(u64::from(T_SYSCALL)), "System call");
        assert_eq!(trapname(u64::from(IRQ_OFFSET) + 7), "Hardware Interrupt");
        assert_eq!(trapname(200), "(unknown trap)");
    }

    #[test]
    fn test_fault_record_carries_trap_number() {
        let mut frame = CapturedFrame::user(0x80_1234, 0xeebf_dff8);
        frame.trapno = u64::from(T_PGFLT);
        frame.err = 0x7;
        frame.regs.rax = 0xaa;

        let record = frame.fault_record(0xdead_b000);
        assert_eq!(record.err, 14);
        assert_eq!(record.fault_va, 0xdead_b000);
        assert_eq!(record.rip, frame.rip);
        assert_eq!(record.rsp, frame.rsp);
        assert_eq!(record.regs.rax, 0xaa);
    }
}
