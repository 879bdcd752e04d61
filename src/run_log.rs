// src/run_log.rs
use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::clock::Clock;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Append-only log of one run. Each entry is echoed to `tracing` as it is
/// recorded and the collected text goes into the admin report at the end.
pub struct RunLog {
    clock: Arc<dyn Clock>,
    lines: Vec<String>,
}

impl RunLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lines: Vec::new(),
        }
    }

    pub fn record(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        let timestamp = self.clock.now().format(TIMESTAMP_FORMAT);
        self.lines.push(format!("{} [{}] {}", timestamp, level, message));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(LogLevel::Error, message);
    }

    #[cfg(test)]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[cfg(test)]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }

    pub fn to_text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}
