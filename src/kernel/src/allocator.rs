//! Kernel heap allocation.
//!
//! The heap is a fixed region inside the kernel image, handed to a
//! linked-list allocator at boot.

use core::ptr::addr_of_mut;

use linked_list_allocator::LockedHeap;

/// The size of the kernel heap. Holds the frame pool and environment table.
pub const HEAP_SIZE: usize = 32 * 1024 * 1024;

#[repr(C, align(4096))]
struct Heap([u8; HEAP_SIZE]);

static mut HEAP: Heap = Heap([0; HEAP_SIZE]);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap. Must run once, before the first allocation.
pub fn init_heap() {
    // SAFETY: HEAP is used for nothing else, and this runs once on the boot
    // CPU before any allocation.
    unsafe {
        ALLOCATOR.lock().init(addr_of_mut!(HEAP).cast::<u8>(), HEAP_SIZE);
    }
}
