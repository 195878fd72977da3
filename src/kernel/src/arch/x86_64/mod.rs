//! x86_64 bare-metal support.
//!
//! Segment and task state setup, kernel stack mappings, the 8259 PICs,
//! COM1, the trap entry stubs and the [`Hardware`](machine::Hardware)
//! machine that ties them to the kernel.

pub mod gdt;
pub mod machine;
pub mod paging;
pub mod pic;
pub mod serial;
pub mod trapentry;

pub use serial::SERIAL;

/// Halts the CPU until the next interrupt.
#[inline]
pub fn hlt() {
    x86_64::instructions::hlt();
}

/// Halts the CPU for good.
///
/// Interrupts are disabled first so that nothing wakes it again.
pub fn halt_loop() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        hlt();
    }
}
