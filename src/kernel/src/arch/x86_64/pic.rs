//! Support for the primary and secondary 8259 Programmable Interrupt Controllers (PICs).

use pic8259::ChainedPics;
use skerry_common::trap::IRQ_OFFSET;
use spin::Mutex;

/// The offset of the first PIC (master).
///
/// IRQs 0..7 are mapped to vectors 32..39.
pub const PIC_1_OFFSET: u8 = IRQ_OFFSET;

/// The offset of the second PIC (slave).
///
/// IRQs 8..15 are mapped to vectors 40..47.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The global instance of the chained PICs.
// SAFETY: the offsets keep IRQ vectors clear of the processor exceptions.
pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remaps both PICs above the exception vectors.
pub fn init() {
    // SAFETY: called once on the boot CPU before interrupts are enabled.
    unsafe { PICS.lock().initialize() };
}

/// Acknowledges hardware IRQ line `irq`.
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: `irq` is a line the PICs just delivered.
    unsafe { PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq) };
}
