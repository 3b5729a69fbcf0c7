//! Observability sink handed to every pipeline component.
//!
//! Components never reach for a process-global logger directly; they receive an
//! `Arc<dyn LogSink>` at construction. Production wiring uses [`LogFacadeSink`],
//! which forwards to the `log` facade (and from there to `env_logger`). Tests use
//! [`MemorySink`] to assert on what was reported.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::Level;

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, target: &str, args: fmt::Arguments<'_>);

    fn error(&self, target: &str, args: fmt::Arguments<'_>) {
        self.log(Level::Error, target, args);
    }

    fn warn(&self, target: &str, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, target, args);
    }

    fn info(&self, target: &str, args: fmt::Arguments<'_>) {
        self.log(Level::Info, target, args);
    }

    fn debug(&self, target: &str, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, target, args);
    }
}

/// Forwards every record to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFacadeSink;

impl LogFacadeSink {
    pub fn shared() -> Arc<dyn LogSink> {
        Arc::new(Self)
    }
}

impl LogSink for LogFacadeSink {
    fn log(&self, level: Level, target: &str, args: fmt::Arguments<'_>) {
        log::log!(target: target, level, "{}", args);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Records log lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True when some record at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    pub fn count(&self, level: Level) -> usize {
        self.records().iter().filter(|r| r.level == level).count()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, target: &str, args: fmt::Arguments<'_>) {
        let record = LogRecord {
            level,
            target: target.to_string(),
            message: args.to_string(),
        };
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_level_and_target() {
        let sink = MemorySink::new();
        sink.warn("camwatch::mux", format_args!("queue full for {}", "cam1"));
        sink.info("camwatch::reader", format_args!("connected"));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, Level::Warn);
        assert_eq!(records[0].target, "camwatch::mux");
        assert!(sink.contains(Level::Warn, "queue full for cam1"));
        assert!(!sink.contains(Level::Error, "connected"));
        assert_eq!(sink.count(Level::Info), 1);
    }
}
