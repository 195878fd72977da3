//! Device drivers serviced by the trap dispatcher.
//!
//! Only the interrupt half lives here; device register access is in `arch`.

pub mod input;

pub use input::{BytePort, InputDevice, InputQueue, KEYBOARD_QUEUE, SERIAL_QUEUE};
