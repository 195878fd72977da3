//! Boot-time page mappings.
//!
//! The boot loader maps the kernel image and all of physical memory at
//! `physical_memory_offset`. The per-CPU kernel stacks below `KSTACKTOP` are
//! mapped here, page by page, leaving each guard gap unmapped.

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::cpu::NCPU;
use crate::cpu::CpuId;
use crate::trap::vectors::kernel_stack_pages;

/// A mapper over the active page tables.
///
/// # Safety
///
/// All of physical memory must be mapped at `physical_memory_offset`, and
/// this must be called only once.
pub unsafe fn init_mapper(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (level_4_frame, _) = Cr3::read();
    let virt = physical_memory_offset + level_4_frame.start_address().as_u64();
    // SAFETY: the caller guarantees the offset mapping, so `virt` is the
    // active level 4 table, and nothing else holds a reference to it.
    let level_4_table = unsafe { &mut *virt.as_mut_ptr::<PageTable>() };
    // SAFETY: as above.
    unsafe { OffsetPageTable::new(level_4_table, physical_memory_offset) }
}

/// Hands out the usable frames of the boot loader's memory map, in order.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Allocator over `memory_map`.
    ///
    /// # Safety
    ///
    /// Every region marked usable must really be unused.
    pub unsafe fn init(memory_map: &'static MemoryMap) -> Self {
        Self {
            memory_map,
            next: 0,
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        self.memory_map
            .iter()
            .filter(|region| region.region_type == MemoryRegionType::Usable)
            .map(|region| region.range.start_addr()..region.range.end_addr())
            .flat_map(|range| range.step_by(4096))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

// SAFETY: each usable frame is handed out at most once.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

/// Maps every CPU's kernel stack. Guard gaps are left unmapped.
pub fn map_kernel_stacks(
    mapper: &mut impl Mapper<Size4KiB>,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MapToError<Size4KiB>> {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    for cpu in (0..NCPU as u8).map(CpuId::new) {
        let pages = kernel_stack_pages(cpu);
        let first = Page::<Size4KiB>::containing_address(VirtAddr::new(pages.start));
        let last = Page::<Size4KiB>::containing_address(VirtAddr::new(pages.end - 1));
        for page in Page::range_inclusive(first, last) {
            let frame = frame_allocator
                .allocate_frame()
                .ok_or(MapToError::FrameAllocationFailed)?;
            // SAFETY: the frame is fresh and the page lies in the kernel
            // stack region, which nothing else maps.
            unsafe {
                mapper.map_to(page, frame, flags, frame_allocator)?.flush();
            }
        }
        log::debug!("CPU {} kernel stack at {:#x}..{:#x}", cpu, pages.start, pages.end);
    }
    Ok(())
}
