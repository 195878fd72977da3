//! Formatted output to the machine console.
//!
//! Use the [`cprint!`](crate::cprint) and [`cprintln!`](crate::cprintln)
//! macros with anything implementing [`Console`].

use core::fmt::{self, Write};

use skerry_hal::Console;

/// Adapts a [`Console`] to [`fmt::Write`].
pub struct ConsoleWriter<'a, C: Console + ?Sized>(pub &'a mut C);

impl<C: Console + ?Sized> Write for ConsoleWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Prints to a console without a newline.
#[macro_export]
macro_rules! cprint {
    ($console:expr, $($arg:tt)*) => {
        $crate::console::_print(&mut *$console, format_args!($($arg)*))
    };
}

/// Prints to a console with a newline.
#[macro_export]
macro_rules! cprintln {
    ($console:expr) => ($crate::cprint!($console, "\n"));
    ($console:expr, $($arg:tt)*) => ($crate::cprint!($console, "{}\n", format_args!($($arg)*)))
}

/// Internal print function used by macros.
#[doc(hidden)]
pub fn _print<C: Console + ?Sized>(console: &mut C, args: fmt::Arguments<'_>) {
    // ConsoleWriter never reports an error
    let _ = ConsoleWriter(console).write_fmt(args);
}
