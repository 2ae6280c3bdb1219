//! A `log` sink for the stress binary: one line per record on stderr, tagged with the calling thread.

use std::{io::Write, sync::OnceLock};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::thread;

pub struct ConsoleLogger {
    max_level: LevelFilter,
}

impl ConsoleLogger {
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Call this once at start-up
    pub fn init(self) -> Result<(), SetLoggerError> {
        // set_logger wants a &'static dyn Log
        static LOGGER: OnceLock<ConsoleLogger> = OnceLock::new();
        let max_level = self.max_level;
        let logger = LOGGER.get_or_init(|| self);
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // "[LEVEL] thread#N target: message", stderr is locked per line
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{}] {} {}: {}",
            record.level(),
            thread::current(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
