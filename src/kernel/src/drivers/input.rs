//! Interrupt-driven byte input.
//!
//! The keyboard and serial IRQ handlers drain their device into a bounded
//! lock-free queue; readers pop from it outside interrupt context.

use crossbeam_queue::ArrayQueue;
use skerry_hal::IrqDevice;
use spin::Once;

/// Capacity of each input queue.
pub const QUEUE_SIZE: usize = 100;

/// A bounded queue filled from interrupt context.
pub struct InputQueue {
    name: &'static str,
    queue: Once<ArrayQueue<u8>>,
}

impl InputQueue {
    /// An uninitialized queue. Pushes are dropped until [`InputQueue::init`].
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: Once::new(),
        }
    }

    /// Allocates the queue. Idempotent.
    pub fn init(&self) {
        self.queue.call_once(|| ArrayQueue::new(QUEUE_SIZE));
    }

    /// Queues one byte. Returns false if it was dropped.
    pub fn push(&self, byte: u8) -> bool {
        match self.queue.get() {
            Some(queue) => {
                if queue.push(byte).is_err() {
                    log::warn!("{} queue full; dropping input", self.name);
                    return false;
                }
                true
            }
            None => {
                log::warn!("{} queue not initialized", self.name);
                false
            }
        }
    }

    /// Takes the oldest queued byte.
    pub fn pop(&self) -> Option<u8> {
        self.queue.get()?.pop()
    }
}

/// Keyboard scancodes.
pub static KEYBOARD_QUEUE: InputQueue = InputQueue::new("scancode");
/// Bytes received on the serial port.
pub static SERIAL_QUEUE: InputQueue = InputQueue::new("serial");

/// Source of input bytes behind an interrupt line.
pub trait BytePort {
    /// Next pending byte, if the device has one.
    fn read_byte(&mut self) -> Option<u8>;
}

/// Drains a port into a queue on every interrupt.
pub struct InputDevice<P: BytePort> {
    port: P,
    queue: &'static InputQueue,
}

impl<P: BytePort> InputDevice<P> {
    /// Connects `port` to `queue`.
    pub fn new(port: P, queue: &'static InputQueue) -> Self {
        queue.init();
        Self { port, queue }
    }

    /// The port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

impl<P: BytePort> IrqDevice for InputDevice<P> {
    fn handle_interrupt(&mut self) {
        while let Some(byte) = self.port.read_byte() {
            if !self.queue.push(byte) {
                break;
            }
        }
    }
}
