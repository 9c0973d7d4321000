//! Logging infrastructure.
//!
//! Mirrors the donor firmware's combined-sink logger, trimmed to the serial
//! backend: the CBMEM console and framebuffer sinks belonged to the UEFI
//! boot path, which is out of scope for this crate.

use crate::arch::x86_64::rdtsc;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{Level, LevelFilter, Metadata, Record};

static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Relative TSC ticks since boot, in thousands, for readable timestamps.
pub fn get_timestamp_k() -> u64 {
    let current = rdtsc();
    let boot = BOOT_TSC.load(Ordering::Relaxed);
    current.saturating_sub(boot) / 1000
}

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level_str = match record.level() {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33mWARN\x1b[0m ",
            Level::Info => "\x1b[32mINFO\x1b[0m ",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        };
        let ts = get_timestamp_k();
        crate::serial_println!("[{:>10}] [{}] {}", ts, level_str, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Initialize the logging subsystem. Call after `serial::init_early`.
pub fn init() {
    BOOT_TSC.store(rdtsc(), Ordering::Relaxed);
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .expect("logger already initialized");
}

/// Set the maximum log level.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
