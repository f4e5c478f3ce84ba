//! Hierarchical buffered logger.
//!
//! Every node gets its own logger; the graph's main logger adopts them as
//! children when nodes are added so a single extraction at shutdown renders
//! all buffered lines merged and timestamped, even for nodes destroyed
//! earlier. Terminal mirroring forwards entries through the `log` facade as
//! they arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug)]
struct LogEntry {
    timestamp_micros: u128,
    level: LogLevel,
    message: String,
}

/// Thread-safe append-only log buffer with child attachment.
pub struct Logger {
    name: String,
    entries: Mutex<Vec<LogEntry>>,
    children: Mutex<Vec<Arc<Logger>>>,
    mirror_to_terminal: AtomicBool,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Logger {
        Logger {
            name: name.into(),
            entries: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            mirror_to_terminal: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_mirror_to_terminal(&self, enabled: bool) {
        self.mirror_to_terminal.store(enabled, Ordering::Relaxed);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        if self.mirror_to_terminal.load(Ordering::Relaxed) {
            log::log!(level.as_log_level(), "[{}] {}", self.name, message);
        }
        self.entries.lock().push(LogEntry {
            timestamp_micros: now_micros(),
            level,
            message,
        });
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Adopt a child logger. Its entries appear in this logger's
    /// extraction, prefixed with the child's name.
    pub fn add_child(&self, child: Arc<Logger>) {
        self.children.lock().push(child);
    }

    /// Detach every child. Extraction happens before teardown; clearing
    /// afterwards keeps destroyed nodes from lingering in the tree.
    pub fn clear_children(&self) {
        self.children.lock().clear();
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Merged, timestamp-ordered text rendering of this logger and all its
    /// children.
    pub fn extract_logs(&self) -> String {
        let mut collected: Vec<(u128, String)> = Vec::new();
        self.collect_into(&mut collected, &self.name);
        collected.sort_by_key(|(ts, _)| *ts);
        let mut out = String::new();
        for (_, line) in collected {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn collect_into(&self, out: &mut Vec<(u128, String)>, prefix: &str) {
        for entry in self.entries.lock().iter() {
            out.push((
                entry.timestamp_micros,
                format!(
                    "[{:>14}] [{:5}] [{}] {}",
                    entry.timestamp_micros, entry.level.tag(), prefix, entry.message
                ),
            ));
        }
        for child in self.children.lock().iter() {
            let child_prefix = format!("{}/{}", prefix, child.name);
            child.collect_into(out, &child_prefix);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

fn now_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_render_in_order() {
        let logger = Logger::new("main");
        logger.info("first");
        logger.warn("second");
        let text = logger.extract_logs();
        let first = text.find("first").unwrap();
        let second = text.find("second").unwrap();
        assert!(first < second);
        assert!(text.contains("[WARN "));
    }

    #[test]
    fn children_merge_into_extraction() {
        let main = Logger::new("graph");
        let child = Arc::new(Logger::new("camera"));
        main.add_child(Arc::clone(&child));

        child.info("compiled");
        main.info("frame done");

        let text = main.extract_logs();
        assert!(text.contains("[graph/camera] compiled"));
        assert!(text.contains("[graph] frame done"));
    }

    #[test]
    fn extraction_survives_child_drop() {
        let main = Logger::new("graph");
        let child = Arc::new(Logger::new("node"));
        main.add_child(Arc::clone(&child));
        child.error("boom");
        drop(child);
        // The tree keeps the Arc alive until clear_children.
        assert!(main.extract_logs().contains("boom"));
        main.clear_children();
        assert!(!main.extract_logs().contains("boom"));
    }
}
