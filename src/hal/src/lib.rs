//! Skerry Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines traits that abstract away platform-specific hardware details.

#![no_std]

/// Trait for the processor state the trap path inspects and controls.
pub trait Processor {
    /// Whether maskable interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;
    /// The linear address that caused the most recent page fault (CR2).
    fn fault_address(&self) -> u64;
    /// Loads the interrupt descriptor table register.
    fn load_vector_table(&mut self, base: u64, limit: u16);
    /// Installs a task state segment descriptor and loads the task register.
    fn load_task_state(&mut self, selector: u16, base: u64, limit: u32);
    /// Stops this CPU until the next interrupt.
    fn halt(&mut self);
}

/// Trait for controlling interrupts.
pub trait InterruptController {
    /// Signals the end of an interrupt to the controller.
    fn end_of_interrupt(&mut self, irq: u8);
}

/// Trait for a text-based console.
pub trait Console {
    /// Writes a string to the console.
    fn write_str(&mut self, s: &str);
    /// Prints `prompt` and reads one line of input into `buf`.
    ///
    /// Returns `None` when no more input will ever arrive.
    fn read_line<'a>(&mut self, prompt: &str, buf: &'a mut [u8]) -> Option<&'a str>;
}

/// Trait for a device that services its own interrupt line.
pub trait IrqDevice {
    /// Handles one interrupt from the device.
    fn handle_interrupt(&mut self);
}
