//! Kernel logger.
//!
//! Implements `log::Log` and forwards every record, formatted as
//! `[LEVEL] message`, to a sink registered at initialization. On bare metal
//! the sink is COM1.

use core::fmt;

use log::{LevelFilter, Metadata, Record, SetLoggerError};
use spin::Once;

/// Where formatted log lines go.
pub type LogSink = fn(fmt::Arguments<'_>);

static LOGGER: KernelLogger = KernelLogger;
static SINK: Once<LogSink> = Once::new();

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            sink(format_args!("[{}] {}\n", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger.
///
/// The first sink registered wins. Fails if some logger is already
/// installed.
pub fn init(sink: LogSink, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    log::info!("logger initialized with level {}", max_level);
    Ok(())
}

/// Installs the kernel logger at the configured default level.
pub fn init_default(sink: LogSink) -> Result<(), SetLoggerError> {
    init(sink, crate::config::log::DEFAULT_LEVEL)
}
