//! The global descriptor tables.
//!
//! The boot CPU first loads a table with only the kernel and user segments.
//! Once a CPU's task state exists it switches to its own table, which
//! carries the same segments plus its task state descriptor at `GD_TSS0`.

use spin::Once;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

use crate::config::cpu::NCPU;
use crate::cpu::CpuId;
use crate::trap::vectors::{descriptor_table, Selectors};

type Table = (GlobalDescriptorTable, Selectors);

static BOOT_GDT: Once<Table> = Once::new();

#[allow(clippy::declare_interior_mutable_const)]
const UNBUILT: Once<Table> = Once::new();

static CPU_GDTS: [Once<Table>; NCPU] = [UNBUILT; NCPU];

fn load(table: &'static Table) {
    let (gdt, selectors) = table;
    gdt.load();
    // SAFETY: the selectors name the kernel segments of the table just
    // loaded, which lives in a static.
    unsafe {
        CS::set_reg(selectors.kernel_code);
        SS::set_reg(selectors.kernel_data);
        DS::set_reg(selectors.kernel_data);
        ES::set_reg(selectors.kernel_data);
    }
}

/// Loads the segment-only table and reloads the segment registers on this
/// CPU. Must run before the vector table is built.
pub fn init() {
    load(BOOT_GDT.call_once(|| descriptor_table(None)));
}

/// Switches `cpu` to its own table with the task state at `base`, and loads
/// the task register.
///
/// `base` must be the address of a task state segment that is never moved
/// or freed.
pub fn install_tss(cpu: CpuId, base: u64) {
    let Some(slot) = CPU_GDTS.get(cpu.index()) else {
        log::error!("CPU {} beyond the configured {}", cpu, NCPU);
        return;
    };
    if slot.is_completed() {
        log::warn!("CPU {} already has its task state", cpu);
        return;
    }
    // SAFETY: the caller passes a task state segment with static storage.
    let tss = unsafe { Descriptor::tss_segment_unchecked(base as *const TaskStateSegment) };
    let table = slot.call_once(|| descriptor_table(Some(tss)));
    load(table);
    if let Some(selector) = table.1.tss {
        // SAFETY: the descriptor was just installed and is not busy.
        unsafe { load_tss(selector) };
    }
}
