//! The bare-metal [`Machine`].

use core::arch::asm;

use skerry_common::memlayout::{KSTKSIZE, WORD_SIZE};
use skerry_common::trap::{IRQ_KBD, IRQ_SERIAL};
use skerry_hal::{Console, InterruptController, IrqDevice, Processor};
use spin::Once;
use x86_64::instructions::port::Port;
use x86_64::instructions::tables::lidt;
use x86_64::registers::control::Cr2;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::serial::{SerialConsole, SerialRx};
use super::{gdt, pic};
use crate::cpu::CpuId;
use crate::drivers::{BytePort, InputDevice, KEYBOARD_QUEUE, SERIAL_QUEUE};
use crate::monitor::{DebugInfo, Introspect, KernelLayout};
use crate::trap::frame::GD_TSS0;
use crate::Machine;

const PS2_DATA: u16 = 0x60;
const PS2_STATUS: u16 = 0x64;
const PS2_OUTPUT_FULL: u8 = 1 << 0;

extern "C" {
    static __ehdr_start: u8;
    static etext: u8;
    static edata: u8;
    static end: u8;
}

static ENTRY: Once<u64> = Once::new();

/// Records the kernel entry point for `kerninfo`.
pub fn set_kernel_entry(entry: u64) {
    ENTRY.call_once(|| entry);
}

/// The PS/2 keyboard controller.
pub struct Ps2Port;

impl BytePort for Ps2Port {
    fn read_byte(&mut self) -> Option<u8> {
        let mut status: Port<u8> = Port::new(PS2_STATUS);
        let mut data: Port<u8> = Port::new(PS2_DATA);
        // SAFETY: standard PS/2 controller ports; reading data only after
        // the status register reports it consumes exactly one byte.
        unsafe {
            if status.read() & PS2_OUTPUT_FULL == 0 {
                return None;
            }
            Some(data.read())
        }
    }
}

/// This CPU's view of the hardware.
pub struct Hardware {
    cpu: CpuId,
    console: SerialConsole,
    keyboard: InputDevice<Ps2Port>,
    serial: InputDevice<SerialRx>,
}

impl Hardware {
    /// Hardware as seen from `cpu`.
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            console: SerialConsole,
            keyboard: InputDevice::new(Ps2Port, &KEYBOARD_QUEUE),
            serial: InputDevice::new(SerialRx, &SERIAL_QUEUE),
        }
    }

    /// The CPU this view belongs to.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

fn stack_pointer() -> u64 {
    let rsp: u64;
    // SAFETY: reads a register.
    unsafe { asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags)) };
    rsp
}

impl Processor for Hardware {
    fn interrupts_enabled(&self) -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    fn fault_address(&self) -> u64 {
        Cr2::read().as_u64()
    }

    fn load_vector_table(&mut self, base: u64, limit: u16) {
        let pointer = DescriptorTablePointer {
            limit,
            base: VirtAddr::new(base),
        };
        // SAFETY: `base` is the shared vector table, which lives for the
        // rest of the kernel's life.
        unsafe { lidt(&pointer) };
    }

    fn load_task_state(&mut self, selector: u16, base: u64, _limit: u32) {
        if selector != GD_TSS0 {
            log::error!("CPU {}: no task state descriptor at {:#x}", self.cpu, selector);
            return;
        }
        gdt::install_tss(self.cpu, base);
    }

    fn halt(&mut self) {
        super::hlt();
    }
}

impl InterruptController for Hardware {
    fn end_of_interrupt(&mut self, irq: u8) {
        pic::end_of_interrupt(irq);
    }
}

impl Console for Hardware {
    fn write_str(&mut self, s: &str) {
        self.console.write_str(s);
    }

    fn read_line<'a>(&mut self, prompt: &str, buf: &'a mut [u8]) -> Option<&'a str> {
        self.console.read_line(prompt, buf)
    }
}

impl Introspect for Hardware {
    fn frame_pointer(&self) -> u64 {
        let rbp: u64;
        // SAFETY: reads a register.
        unsafe { asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags)) };
        rbp
    }

    /// Only words on the live part of the current stack are readable.
    fn read_word(&self, addr: u64) -> Option<u64> {
        let low = stack_pointer();
        let high = low.saturating_add(KSTKSIZE);
        if addr % WORD_SIZE != 0 || addr < low || addr > high - WORD_SIZE {
            return None;
        }
        // SAFETY: `addr` is aligned and inside the mapped stack this code
        // is running on.
        Some(unsafe { (addr as *const u64).read_volatile() })
    }

    fn resolve(&self, _rip: u64) -> Option<DebugInfo> {
        None
    }

    fn kernel_layout(&self) -> KernelLayout {
        // SAFETY: linker-defined symbols; only their addresses are taken.
        unsafe {
            KernelLayout {
                start: core::ptr::addr_of!(__ehdr_start) as u64,
                entry: ENTRY.get().copied().unwrap_or(0),
                etext: core::ptr::addr_of!(etext) as u64,
                edata: core::ptr::addr_of!(edata) as u64,
                end: core::ptr::addr_of!(end) as u64,
            }
        }
    }
}

impl Machine for Hardware {
    fn device(&mut self, irq: u8) -> Option<&mut dyn IrqDevice> {
        match irq {
            IRQ_KBD => Some(&mut self.keyboard),
            IRQ_SERIAL => Some(&mut self.serial),
            _ => None,
        }
    }
}
