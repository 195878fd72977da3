//! Skerry Kernel Entry Point
//!
//! Boots the first CPU, installs the trap vectors and hands the CPU to the
//! scheduler. With no environment to run it drops into the kernel monitor
//! on COM1.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;

    use bootloader::{entry_point, BootInfo};
    use skerry_kernel::arch::x86_64::{self, machine, paging, trapentry};
    use skerry_kernel::trap::vectors;
    use skerry_kernel::{serial_println, CpuId, Kernel};
    use spin::Mutex;
    use ::x86_64::VirtAddr;

    entry_point!(kernel_main);

    /// Kernel entry point, called by the bootloader on the boot CPU.
    fn kernel_main(boot_info: &'static BootInfo) -> ! {
        skerry_kernel::init();
        log::info!("Skerry kernel booting");

        let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);
        // SAFETY: the boot loader maps all physical memory at the offset and
        // marks only free frames usable.
        let (mut mapper, mut frame_allocator) = unsafe {
            (
                paging::init_mapper(phys_mem_offset),
                paging::BootInfoFrameAllocator::init(&boot_info.memory_map),
            )
        };
        if let Err(err) = paging::map_kernel_stacks(&mut mapper, &mut frame_allocator) {
            serial_println!("kernel stacks: {:?}", err);
            x86_64::halt_loop();
        }

        machine::set_kernel_entry(kernel_main as usize as u64);
        let table = vectors::init(trapentry::trampoline);
        let id = CpuId::new(0);
        trapentry::init_cpu(id, table);
        trapentry::KERNEL.call_once(|| Mutex::new(Kernel::new()));

        log::info!("CPU {} entering scheduler", id);
        trapentry::start(id)
    }

    /// Panic handler.
    ///
    /// Called when the kernel encounters an unrecoverable error.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("KERNEL PANIC: {}", info);
        x86_64::halt_loop()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("skerry-kernel boots on bare-metal x86_64 only; run the hosted tests instead");
}
