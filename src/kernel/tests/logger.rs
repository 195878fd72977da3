//! The kernel logger, installed once for this test binary.

use core::fmt;
use std::sync::Mutex;

use log::LevelFilter;
use skerry_kernel::logger;

static LINES: Mutex<String> = Mutex::new(String::new());

fn capture(args: fmt::Arguments<'_>) {
    LINES.lock().unwrap().push_str(&args.to_string());
}

#[test]
fn test_records_reach_the_sink() {
    logger::init(capture, LevelFilter::Debug).unwrap();
    assert!(logger::init(capture, LevelFilter::Trace).is_err());

    log::warn!("spurious interrupt on irq {}", 7);
    log::trace!("filtered out");

    let lines = LINES.lock().unwrap();
    assert!(lines.contains("[INFO] logger initialized with level DEBUG\n"), "{lines}");
    assert!(lines.contains("[WARN] spurious interrupt on irq 7\n"), "{lines}");
    assert!(!lines.contains("filtered out"), "{lines}");
}
