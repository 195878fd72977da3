//! Serial port driver for x86_64.
//!
//! COM1 (0x3F8) carries the console, the monitor and the log.

use core::fmt::{self, Write};

use skerry_hal::Console;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::port::Port;

use crate::drivers::BytePort;

/// COM1 I/O port address.
const COM1_PORT: u16 = 0x3F8;
/// Line status register of COM1.
const COM1_LSR: u16 = COM1_PORT + 5;
/// Line status bit: a received byte is waiting.
const LSR_DATA_READY: u8 = 1 << 0;

/// Global serial port instance, lazily initialized.
pub static SERIAL: spin::Once<Mutex<SerialPort>> = spin::Once::new();

/// Initializes the global serial port. Idempotent.
pub fn init() -> &'static Mutex<SerialPort> {
    SERIAL.call_once(|| {
        // SAFETY: COM1_PORT is the standard COM1 base. We run in ring 0 with
        // full port access and nothing else drives this UART.
        let mut serial = unsafe { SerialPort::new(COM1_PORT) };
        serial.init();
        Mutex::new(serial)
    })
}

/// Prints to the serial port without a newline.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::_print(format_args!($($arg)*))
    };
}

/// Prints to the serial port with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)))
}

/// Internal print function used by macros and the log sink.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    // SerialPort's fmt::Write never fails
    let _ = init().lock().write_fmt(args);
}

fn data_ready() -> bool {
    let mut lsr: Port<u8> = Port::new(COM1_LSR);
    // SAFETY: reading the line status register has no side effects.
    let status = unsafe { lsr.read() };
    status & LSR_DATA_READY != 0
}

/// The receive side of COM1, drained by the serial IRQ.
pub struct SerialRx;

impl BytePort for SerialRx {
    fn read_byte(&mut self) -> Option<u8> {
        if !data_ready() {
            return None;
        }
        Some(init().lock().receive())
    }
}

/// COM1 as the kernel console.
///
/// Input is polled: the monitor runs with interrupts disabled.
pub struct SerialConsole;

impl Console for SerialConsole {
    fn write_str(&mut self, s: &str) {
        let _ = init().lock().write_str(s);
    }

    fn read_line<'a>(&mut self, prompt: &str, buf: &'a mut [u8]) -> Option<&'a str> {
        self.write_str(prompt);
        let mut len = 0;
        loop {
            let byte = init().lock().receive();
            match byte {
                b'\r' | b'\n' => {
                    self.write_str("\n");
                    break;
                }
                // backspace, delete
                0x08 | 0x7f => {
                    if len > 0 {
                        len -= 1;
                        self.write_str("\x08 \x08");
                    }
                }
                0x20..=0x7e if len < buf.len().saturating_sub(1) => {
                    buf[len] = byte;
                    len += 1;
                    init().lock().send(byte);
                }
                _ => {}
            }
        }
        core::str::from_utf8(&buf[..len]).ok()
    }
}
