//! Logger handed to every component at construction.
//!
//! Components never reach for a global logger. The binary installs
//! `env_logger` and passes a [`ConsoleLogger`]; tests pass a
//! [`CaptureLogger`] and assert on what was recorded.

use log::Level;
use std::sync::{Arc, Mutex};

/// Sink for pipeline diagnostics.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
}

pub type SharedLogger = Arc<dyn Logger>;

/// Forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn log(&self, level: Level, message: &str) {
        log::log!(target: "disk_builder", level, "{}", message);
    }
}

impl ConsoleLogger {
    pub fn shared() -> SharedLogger {
        Arc::new(ConsoleLogger)
    }
}

/// Records every message in memory.
#[derive(Debug, Default)]
pub struct CaptureLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl CaptureLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Messages logged at exactly `level`.
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }
}

impl Logger for CaptureLogger {
    fn log(&self, level: Level, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((level, message.to_string()));
        }
    }
}
