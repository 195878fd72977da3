//! Trap entry and exit.
//!
//! One 16-byte stub per vector pushes a zero error code when the processor
//! does not, then the vector number, and joins the common path, which pushes
//! the general registers so that the stack holds a [`CapturedFrame`] and
//! calls [`skerry_trap`].

use core::arch::global_asm;
use core::ptr::addr_of;

use lazy_static::lazy_static;
use spin::{Mutex, Once};
use x86_64::VirtAddr;

use super::halt_loop;
use super::machine::Hardware;
use crate::config::cpu::NCPU;
use crate::cpu::{CpuId, CpuState, TrapContext};
use crate::sched::Transfer;
use crate::sync::TrapNesting;
use crate::trap::vectors::kernel_stack_top;
use crate::trap::{init_percpu, CapturedFrame, Origin, TerminalAction, VectorTable};
use crate::{serial_println, Kernel};

global_asm!(
    r#"
    .section .text
    .p2align 4
    .global skerry_vectors
skerry_vectors:
    .set vector, 0
    .rept 256
    .p2align 4
    .if vector == 8 || (vector >= 10 && vector <= 14) || vector == 17
    pushq $vector
    .else
    pushq $0
    pushq $vector
    .endif
    jmp skerry_alltraps
    .set vector, vector + 1
    .endr

skerry_alltraps:
    pushq %rax
    pushq %rcx
    pushq %rdx
    pushq %rbx
    pushq %rbp
    pushq %rsi
    pushq %rdi
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %rsp, %rdi
    call skerry_trap
    ud2

    .global skerry_pop_frame
skerry_pop_frame:
    movq %rdi, %rsp
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rdi
    popq %rsi
    popq %rbp
    popq %rbx
    popq %rdx
    popq %rcx
    popq %rax
    addq $16, %rsp
    iretq

    .global skerry_idle
skerry_idle:
    movq %rdi, %rsp
    sti
1:
    hlt
    jmp 1b
"#,
    options(att_syntax)
);

extern "C" {
    static skerry_vectors: u8;
    fn skerry_pop_frame(frame: *const CapturedFrame) -> !;
    fn skerry_idle(stack_top: u64) -> !;
}

/// Size of one entry stub.
const STUB_SIZE: u64 = 16;

/// The kernel, once booted.
pub static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Which CPUs are inside [`skerry_trap`].
static NESTING: TrapNesting = TrapNesting::new();

lazy_static! {
    /// Per-CPU state, indexed by CPU number.
    pub static ref CPUS: [Mutex<CpuState>; NCPU] =
        core::array::from_fn(|i| Mutex::new(CpuState::new(CpuId::new(i as u8))));
}

/// Entry stub of `vector`.
pub fn trampoline(vector: u8) -> VirtAddr {
    // SAFETY: only the symbol's address is taken.
    let base = unsafe { addr_of!(skerry_vectors) } as u64;
    VirtAddr::new(base + u64::from(vector) * STUB_SIZE)
}

/// Number of the executing CPU, from its initial APIC id.
pub fn this_cpu() -> CpuId {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    CpuId::new((leaf.ebx >> 24) as u8)
}

/// Installs the vector table and `id`'s task state on this CPU.
pub fn init_cpu(id: CpuId, table: &VectorTable) {
    let Some(cpu) = CPUS.get(id.index()) else {
        log::error!("CPU {} beyond the configured {}", id, NCPU);
        return;
    };
    let mut cpu = cpu.lock();
    let mut machine = Hardware::new(id);
    init_percpu(&mut cpu, &mut machine, table);
}

/// Leaves the kernel the way `transfer` says.
fn enter(cpu: CpuId, transfer: Transfer) -> ! {
    match transfer {
        Transfer::Enter { frame, .. } => {
            // SAFETY: the frame was saved by the entry path or built for a
            // new environment with user segments; popping it switches stacks
            // and never returns here.
            unsafe { skerry_pop_frame(&frame) }
        }
        Transfer::Idle => {
            let top = kernel_stack_top(cpu);
            // SAFETY: nothing on the current stack is needed any more.
            unsafe { skerry_idle(top) }
        }
        Transfer::Stopped => halt_loop(),
    }
}

/// Common trap path, called by the entry stubs.
#[no_mangle]
extern "C" fn skerry_trap(frame: *const CapturedFrame) -> ! {
    // SAFETY: the stubs pass the frame they just pushed.
    let frame = unsafe { *frame };
    let id = this_cpu();

    let (Some(kernel), Some(cpu)) = (KERNEL.get(), CPUS.get(id.index())) else {
        serial_println!("trap {} before boot on CPU {}", frame.trapno, id);
        halt_loop();
    };
    // a trap taken while this CPU already works on the kernel is fatal;
    // another CPU holding the kernel only means waiting for it
    let Ok(nesting) = NESTING.enter(id) else {
        serial_println!("recursive trap {} at {:#x} on CPU {}", frame.trapno, frame.rip, id);
        halt_loop();
    };
    let mut kernel = kernel.lock();
    let mut cpu = cpu.lock();

    let mut machine = Hardware::new(id);
    let mut cx = TrapContext::new(&mut cpu, &mut machine);
    let action = kernel.trap(&mut cx, &frame);
    if action == TerminalAction::Halt && frame.origin() == Origin::Kernel {
        log::error!("CPU {} stopped by trap {} from kernel mode", id, frame.trapno);
    }
    let transfer = kernel.run(&mut cx, action);
    drop(cx);
    drop(cpu);
    drop(kernel);
    drop(nesting);
    enter(id, transfer)
}

/// Hands this CPU to the scheduler for the first time.
pub fn start(id: CpuId) -> ! {
    let transfer = match (KERNEL.get(), CPUS.get(id.index())) {
        (Some(shared), Some(cpu)) => {
            let mut kernel = shared.lock();
            let mut cpu = cpu.lock();
            let mut machine = Hardware::new(id);
            let mut cx = TrapContext::new(&mut cpu, &mut machine);
            let action = match kernel.lock().acquire(id) {
                Ok(()) => TerminalAction::Yield,
                Err(err) => kernel.fatal(&mut cx, format_args!("{}", err)),
            };
            kernel.run(&mut cx, action)
        }
        _ => Transfer::Stopped,
    };
    enter(id, transfer)
}
