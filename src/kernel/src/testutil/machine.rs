//! A machine made of plain data.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use skerry_hal::{Console, InterruptController, IrqDevice, Processor};

use crate::monitor::{DebugInfo, Introspect, KernelLayout};
use crate::Machine;

/// A source range and the location it resolves to.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    /// First address covered.
    pub start: u64,
    /// One past the last address covered.
    pub end: u64,
    /// What addresses in the range resolve to.
    pub info: DebugInfo,
}

/// Hosted [`Machine`] that records everything the kernel does to it.
#[derive(Default)]
pub struct HostMachine {
    /// Interrupt flag as the dispatcher will see it.
    pub interrupts: bool,
    /// Fault address register.
    pub cr2: u64,
    /// IRQ lines acknowledged, in order.
    pub eoi: Vec<u8>,
    /// Everything written to the console.
    pub output: String,
    /// Lines the console will return, in order. Exhausted input reads as
    /// end of input.
    pub input: VecDeque<String>,
    /// Last vector table load: base and limit.
    pub idt: Option<(u64, u16)>,
    /// Task state loads: selector, base and limit.
    pub tss: Vec<(u16, u64, u32)>,
    /// Number of halt requests.
    pub halts: usize,
    /// Kernel stack words, by address.
    pub stack: BTreeMap<u64, u64>,
    /// Frame pointer reported to the monitor.
    pub fp: u64,
    /// Debug information.
    pub symbols: Vec<Symbol>,
    /// Kernel image layout.
    pub layout: KernelLayout,
    devices: BTreeMap<u8, Box<dyn IrqDevice>>,
}

impl HostMachine {
    /// A machine with interrupts masked and no input.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues console input lines.
    pub fn script<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) {
        self.input.extend(lines.into_iter().map(ToString::to_string));
    }

    /// Attaches a driver to IRQ line `irq`.
    pub fn attach(&mut self, irq: u8, device: Box<dyn IrqDevice>) {
        self.devices.insert(irq, device);
    }

    /// Returns and clears the console transcript.
    pub fn take_output(&mut self) -> String {
        core::mem::take(&mut self.output)
    }

    /// Lays out a frame-pointer chain on the fake stack.
    ///
    /// Each entry is a return address; frames are placed 0x40 bytes apart
    /// starting at `base` and the first one becomes the current frame
    /// pointer. Returns the frame addresses.
    pub fn push_frames(&mut self, base: u64, rips: &[u64]) -> Vec<u64> {
        let fps: Vec<u64> = (0..rips.len() as u64).map(|i| base + i * 0x40).collect();
        for (i, (&fp, &rip)) in fps.iter().zip(rips).enumerate() {
            let next = fps.get(i + 1).copied().unwrap_or(0);
            self.stack.insert(fp, next);
            self.stack.insert(fp + 8, rip);
            for arg in 0..5u64 {
                self.stack.insert(fp + 16 + arg * 8, (i as u64) << 8 | arg);
            }
        }
        self.fp = fps.first().copied().unwrap_or(0);
        fps
    }
}

impl Processor for HostMachine {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn fault_address(&self) -> u64 {
        self.cr2
    }

    fn load_vector_table(&mut self, base: u64, limit: u16) {
        self.idt = Some((base, limit));
    }

    fn load_task_state(&mut self, selector: u16, base: u64, limit: u32) {
        self.tss.push((selector, base, limit));
    }

    fn halt(&mut self) {
        self.halts += 1;
    }
}

impl InterruptController for HostMachine {
    fn end_of_interrupt(&mut self, irq: u8) {
        self.eoi.push(irq);
    }
}

impl Console for HostMachine {
    fn write_str(&mut self, s: &str) {
        self.output.push_str(s);
    }

    fn read_line<'a>(&mut self, prompt: &str, buf: &'a mut [u8]) -> Option<&'a str> {
        self.output.push_str(prompt);
        let line = self.input.pop_front()?;
        self.output.push_str(&line);
        self.output.push('\n');

        let mut len = line.len().min(buf.len());
        while !line.is_char_boundary(len) {
            len -= 1;
        }
        buf[..len].copy_from_slice(&line.as_bytes()[..len]);
        core::str::from_utf8(&buf[..len]).ok()
    }
}

impl Introspect for HostMachine {
    fn frame_pointer(&self) -> u64 {
        self.fp
    }

    fn read_word(&self, addr: u64) -> Option<u64> {
        self.stack.get(&addr).copied()
    }

    fn resolve(&self, rip: u64) -> Option<DebugInfo> {
        self.symbols
            .iter()
            .find(|sym| (sym.start..sym.end).contains(&rip))
            .map(|sym| sym.info)
    }

    fn kernel_layout(&self) -> KernelLayout {
        self.layout
    }
}

impl Machine for HostMachine {
    fn device(&mut self, irq: u8) -> Option<&mut dyn IrqDevice> {
        match self.devices.get_mut(&irq) {
            Some(device) => Some(device.as_mut()),
            None => None,
        }
    }
}
