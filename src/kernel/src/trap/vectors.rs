//! The interrupt vector table and per-CPU trap context.
//!
//! The table is built once, before any CPU takes a trap, and is shared
//! read-only afterwards. Each CPU then installs its own task state segment
//! (pointing at its private kernel stack) and loads the shared table.

use core::mem::size_of;
use core::ops::Range;

use skerry_common::memlayout::{KSTACKTOP, KSTKGAP, KSTKSIZE};
use skerry_common::trap::{
    IRQ_OFFSET, NIRQS, T_ALIGN, T_BOUND, T_BRKPT, T_DBLFLT, T_DEBUG, T_DEVICE, T_DIVIDE, T_FPERR,
    T_GPFLT, T_ILLOP, T_MCHK, T_NMI, T_OFLOW, T_PGFLT, T_SEGNP, T_SIMDERR, T_STACK, T_SYSCALL,
    T_TSS,
};
use skerry_hal::Processor;
use spin::Once;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::idt::{Entry, InterruptDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::frame::GD_TSS0;
use crate::cpu::{CpuId, CpuState};

/// Number of entries in the vector table.
pub const NVECTORS: usize = 256;

/// Processor exceptions with an entry point, and the privilege level that
/// may raise each one with a software interrupt.
const EXCEPTIONS: [(u8, PrivilegeLevel); 18] = [
    (T_DIVIDE, PrivilegeLevel::Ring0),
    (T_DEBUG, PrivilegeLevel::Ring3),
    (T_NMI, PrivilegeLevel::Ring0),
    (T_BRKPT, PrivilegeLevel::Ring3),
    (T_OFLOW, PrivilegeLevel::Ring0),
    (T_BOUND, PrivilegeLevel::Ring0),
    (T_ILLOP, PrivilegeLevel::Ring0),
    (T_DEVICE, PrivilegeLevel::Ring0),
    (T_DBLFLT, PrivilegeLevel::Ring0),
    (T_TSS, PrivilegeLevel::Ring0),
    (T_SEGNP, PrivilegeLevel::Ring0),
    (T_STACK, PrivilegeLevel::Ring0),
    (T_GPFLT, PrivilegeLevel::Ring0),
    (T_PGFLT, PrivilegeLevel::Ring0),
    (T_FPERR, PrivilegeLevel::Ring0),
    (T_ALIGN, PrivilegeLevel::Ring0),
    (T_MCHK, PrivilegeLevel::Ring0),
    (T_SIMDERR, PrivilegeLevel::Ring0),
];

/// Policy for one vector table entry: where it enters and who may raise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    /// Entry trampoline.
    pub handler: VirtAddr,
    /// Lowest privilege level allowed to raise the vector with `int`.
    pub dpl: PrivilegeLevel,
    /// Whether the entry is valid.
    pub present: bool,
}

impl Gate {
    /// An invalid entry. Raising it is a general protection fault.
    pub fn missing() -> Self {
        Self {
            handler: VirtAddr::zero(),
            dpl: PrivilegeLevel::Ring0,
            present: false,
        }
    }

    /// A kernel interrupt gate. Entering it masks interrupts.
    pub fn interrupt(handler: VirtAddr, dpl: PrivilegeLevel) -> Self {
        Self {
            handler,
            dpl,
            present: true,
        }
    }
}

fn set_gate<F>(entry: &mut Entry<F>, gate: &Gate) {
    // SAFETY: every handler is an entry stub from the trampoline, which
    // saves the whole frame itself and leaves through `iretq`, so the
    // handler function type of the entry is never called.
    unsafe {
        entry.set_handler_addr(gate.handler).set_privilege_level(gate.dpl);
    }
}

/// Writes `gate` into the descriptor for `vector`. Vectors that push an
/// error code or never return only exist as named fields.
fn install(idt: &mut InterruptDescriptorTable, vector: u8, gate: &Gate) {
    match vector {
        T_DBLFLT => set_gate(&mut idt.double_fault, gate),
        T_TSS => set_gate(&mut idt.invalid_tss, gate),
        T_SEGNP => set_gate(&mut idt.segment_not_present, gate),
        T_STACK => set_gate(&mut idt.stack_segment_fault, gate),
        T_GPFLT => set_gate(&mut idt.general_protection_fault, gate),
        T_PGFLT => set_gate(&mut idt.page_fault, gate),
        T_ALIGN => set_gate(&mut idt.alignment_check, gate),
        T_MCHK => set_gate(&mut idt.machine_check, gate),
        _ => set_gate(&mut idt[usize::from(vector)], gate),
    }
}

/// The vector table shared by all CPUs.
///
/// `gates` is the policy the descriptor table was built from, kept so it
/// can be inspected without decoding descriptors.
pub struct VectorTable {
    gates: [Gate; NVECTORS],
    idt: InterruptDescriptorTable,
}

impl VectorTable {
    /// Builds the table. `trampoline(n)` is the entry stub for vector `n`.
    ///
    /// Breakpoint, debug and the syscall vector may be raised from user mode;
    /// every other exception and all IRQ lines are kernel-only. Descriptors
    /// take the code segment that is active while building, so the kernel
    /// segments must already be loaded.
    pub fn build(trampoline: impl Fn(u8) -> VirtAddr) -> Self {
        let mut gates = [Gate::missing(); NVECTORS];
        for (vector, dpl) in EXCEPTIONS {
            gates[usize::from(vector)] = Gate::interrupt(trampoline(vector), dpl);
        }
        gates[usize::from(T_SYSCALL)] = Gate::interrupt(trampoline(T_SYSCALL), PrivilegeLevel::Ring3);
        for irq in 0..NIRQS {
            let vector = IRQ_OFFSET + irq;
            gates[usize::from(vector)] = Gate::interrupt(trampoline(vector), PrivilegeLevel::Ring0);
        }

        let mut idt = InterruptDescriptorTable::new();
        for (vector, gate) in (0..=u8::MAX).zip(gates.iter()) {
            if gate.present {
                install(&mut idt, vector, gate);
            }
        }
        Self { gates, idt }
    }

    /// Entry policy for `vector`.
    pub fn gate(&self, vector: u8) -> &Gate {
        &self.gates[usize::from(vector)]
    }

    /// The descriptor table itself.
    pub fn idt(&self) -> &InterruptDescriptorTable {
        &self.idt
    }

    /// Base address and limit for the descriptor table register.
    pub fn pointer(&self) -> (u64, u16) {
        let limit = (size_of::<InterruptDescriptorTable>() - 1) as u16;
        (&self.idt as *const InterruptDescriptorTable as u64, limit)
    }
}

static VECTORS: Once<VectorTable> = Once::new();

/// Builds the shared vector table on first call and returns it.
pub fn init(trampoline: impl Fn(u8) -> VirtAddr) -> &'static VectorTable {
    VECTORS.call_once(|| {
        let table = VectorTable::build(trampoline);
        log::info!("vector table built");
        table
    })
}

/// The shared vector table, once built.
pub fn vector_table() -> Option<&'static VectorTable> {
    VECTORS.get()
}

/// Top of `cpu`'s kernel stack. Stacks are spaced by a guard gap.
pub const fn kernel_stack_top(cpu: CpuId) -> u64 {
    KSTACKTOP - cpu.index() as u64 * (KSTKSIZE + KSTKGAP)
}

/// Addresses backing `cpu`'s kernel stack. The `KSTKGAP` bytes below them
/// stay unmapped so that an overflow faults instead of running into the
/// next CPU's stack.
pub const fn kernel_stack_pages(cpu: CpuId) -> Range<u64> {
    let top = kernel_stack_top(cpu);
    (top - KSTKSIZE)..top
}

/// Selectors handed out by [`descriptor_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selectors {
    /// Kernel code, `GD_KT`.
    pub kernel_code: SegmentSelector,
    /// Kernel data, `GD_KD`.
    pub kernel_data: SegmentSelector,
    /// User code, `GD_UT`.
    pub user_code: SegmentSelector,
    /// User data, `GD_UD`.
    pub user_data: SegmentSelector,
    /// Task state, `GD_TSS0`, when the table carries one.
    pub tss: Option<SegmentSelector>,
}

/// A global descriptor table with the kernel and user segments, followed by
/// `tss` if given.
///
/// Each CPU gets its own table, so the task state descriptor is always at
/// `GD_TSS0`.
pub fn descriptor_table(tss: Option<Descriptor>) -> (GlobalDescriptorTable, Selectors) {
    let mut gdt = GlobalDescriptorTable::new();
    let selectors = Selectors {
        kernel_code: gdt.add_entry(Descriptor::kernel_code_segment()),
        kernel_data: gdt.add_entry(Descriptor::kernel_data_segment()),
        user_code: gdt.add_entry(Descriptor::user_code_segment()),
        user_data: gdt.add_entry(Descriptor::user_data_segment()),
        tss: tss.map(|descriptor| gdt.add_entry(descriptor)),
    };
    (gdt, selectors)
}

/// A CPU's privilege-transition state.
#[derive(Debug, Clone)]
pub struct PerCpuContext {
    /// Owning CPU.
    pub cpu: CpuId,
    /// Task state segment. `privilege_stack_table[0]` is the stack the CPU
    /// switches to on a trap from user mode.
    pub tss: TaskStateSegment,
    /// Selector the task register is loaded with.
    pub selector: u16,
}

impl PerCpuContext {
    /// Context for `cpu`.
    pub fn new(cpu: CpuId) -> Self {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top(cpu));
        // I/O map beyond the segment limit: no port access from user mode
        tss.iomap_base = size_of::<TaskStateSegment>() as u16;
        Self {
            cpu,
            tss,
            selector: GD_TSS0,
        }
    }

    /// Kernel stack top installed in the TSS.
    pub fn kernel_stack_top(&self) -> u64 {
        self.tss.privilege_stack_table[0].as_u64()
    }
}

/// Installs `cpu`'s task state and loads the shared vector table.
pub fn init_percpu<P: Processor + ?Sized>(cpu: &mut CpuState, processor: &mut P, table: &VectorTable) {
    let id = cpu.id();
    let context = cpu.context.insert(PerCpuContext::new(id));
    processor.load_task_state(
        context.selector,
        &context.tss as *const TaskStateSegment as u64,
        (size_of::<TaskStateSegment>() - 1) as u32,
    );
    let (base, limit) = table.pointer();
    processor.load_vector_table(base, limit);
    log::info!(
        "CPU {}: kernel stack top {:#x}, task selector {:#x}",
        id,
        context.kernel_stack_top(),
        context.selector
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cpu::NCPU;
    use crate::trap::frame::{GD_KD, GD_KT, GD_UD, GD_UT};

    fn stub(vector: u8) -> VirtAddr {
        VirtAddr::new(0xFFFF_FFFF_8010_0000 + u64::from(vector) * 16)
    }

    #[test]
    fn test_user_reachable_vectors() {
        let table = VectorTable::build(stub);
        for vector in [T_BRKPT, T_DEBUG, T_SYSCALL] {
            let gate = table.gate(vector);
            assert!(gate.present, "vector {}", vector);
            assert_eq!(gate.dpl, PrivilegeLevel::Ring3, "vector {}", vector);
        }
        for vector in [T_DIVIDE, T_GPFLT, T_PGFLT, IRQ_OFFSET, IRQ_OFFSET + NIRQS - 1] {
            let gate = table.gate(vector);
            assert!(gate.present);
            assert_eq!(gate.dpl, PrivilegeLevel::Ring0, "vector {}", vector);
            assert_eq!(gate.handler, stub(vector));
        }
    }

    #[test]
    fn test_reserved_vectors_are_missing() {
        let table = VectorTable::build(stub);
        // the vector right after the syscall gate has no entry
        assert_eq!(IRQ_OFFSET + NIRQS, T_SYSCALL);
        for vector in [9, 15, T_SYSCALL + 1, 255] {
            assert!(!table.gate(vector).present, "vector {}", vector);
        }
        assert_eq!(table.idt()[usize::from(T_SYSCALL + 1)].handler_addr(), VirtAddr::zero());
        assert_eq!(table.idt()[255].handler_addr(), VirtAddr::zero());
    }

    #[test]
    fn test_descriptors_point_at_stubs() {
        let table = VectorTable::build(stub);
        let idt = table.idt();
        for vector in [T_DIVIDE, T_BRKPT, T_SIMDERR, IRQ_OFFSET, T_SYSCALL] {
            assert_eq!(idt[usize::from(vector)].handler_addr(), stub(vector), "vector {}", vector);
        }
        assert_eq!(idt.double_fault.handler_addr(), stub(T_DBLFLT));
        assert_eq!(idt.general_protection_fault.handler_addr(), stub(T_GPFLT));
        assert_eq!(idt.page_fault.handler_addr(), stub(T_PGFLT));
        assert_eq!(idt.machine_check.handler_addr(), stub(T_MCHK));

        let (base, limit) = table.pointer();
        assert_eq!(base, idt as *const InterruptDescriptorTable as u64);
        assert_eq!(usize::from(limit) + 1, NVECTORS * 16);
    }

    #[test]
    fn test_descriptor_table_selectors() {
        static TSS: TaskStateSegment = TaskStateSegment::new();

        let (_, selectors) = descriptor_table(None);
        assert_eq!(selectors.kernel_code.0, GD_KT);
        assert_eq!(selectors.kernel_data.0, GD_KD);
        assert_eq!(selectors.user_code.0, GD_UT);
        assert_eq!(selectors.user_data.0, GD_UD);
        assert_eq!(selectors.tss, None);

        let (gdt, selectors) = descriptor_table(Some(Descriptor::tss_segment(&TSS)));
        assert_eq!(selectors.tss.map(|s| s.0), Some(GD_TSS0));
        // null, four segments and the two-slot task state descriptor
        assert_eq!(gdt.as_raw_slice().len(), 7);
    }

    #[test]
    fn test_kernel_stacks_are_disjoint() {
        let stride = KSTKSIZE + KSTKGAP;
        for i in 0..NCPU as u8 {
            let top = kernel_stack_top(CpuId::new(i));
            assert_eq!(KSTACKTOP - top, u64::from(i) * stride);
            if i > 0 {
                let above = kernel_stack_top(CpuId::new(i - 1));
                // this stack plus its guard gap ends where the next one starts
                assert_eq!(top + KSTKSIZE + KSTKGAP, above);
            }
        }
    }

    #[test]
    fn test_guard_gaps_stay_unbacked() {
        let stacks: Vec<_> = (0..NCPU as u8).map(|i| kernel_stack_pages(CpuId::new(i))).collect();
        for (i, stack) in stacks.iter().enumerate() {
            assert_eq!(stack.end - stack.start, KSTKSIZE);
            assert_eq!(stack.start % skerry_common::memlayout::PGSIZE, 0);
            let guard = (stack.start - KSTKGAP)..stack.start;
            for other in &stacks {
                assert!(
                    other.end <= guard.start || other.start >= guard.end,
                    "CPU {}'s guard gap overlaps a stack",
                    i
                );
            }
        }
    }

    #[test]
    fn test_percpu_context() {
        let ctx = PerCpuContext::new(CpuId::new(2));
        assert_eq!(ctx.kernel_stack_top(), KSTACKTOP - 2 * (KSTKSIZE + KSTKGAP));
        assert_eq!(ctx.kernel_stack_top(), kernel_stack_pages(CpuId::new(2)).end);
        assert_eq!(ctx.selector, GD_TSS0);
        assert_eq!(usize::from(ctx.tss.iomap_base), size_of::<TaskStateSegment>());
    }
}
