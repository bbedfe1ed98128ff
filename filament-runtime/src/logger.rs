//! Fiber Logging
//!
//! Effects log through the [`Logger`] trait. The interpreter builds one
//! [`LogRecord`] per `Log` instruction and hands it to every logger
//! installed on the runtime; message and cause are thunks so that loggers
//! filtering the record out never pay for rendering it.
//!
//! Two loggers are provided:
//!
//! - [`StderrLogger`]: renders a [`LogEntry`] as plain text or JSON lines.
//! - [`TracingLogger`]: forwards records as `tracing` events.
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::{Effect, LogLevel};
//!
//! let program = Effect::<(), String>::log(LogLevel::Info, "request completed")
//!     .log_span("handler")
//!     .log_annotate("method", "GET");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::panic::Location;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::fiber::FiberId;
use crate::fiber_ref::FiberRefs;

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    #[default]
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a log level, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" | "5" => Some(LogLevel::Trace),
            "DEBUG" | "4" => Some(LogLevel::Debug),
            "INFO" | "3" => Some(LogLevel::Info),
            "WARN" | "WARNING" | "2" => Some(LogLevel::Warn),
            "ERROR" | "ERR" | "1" => Some(LogLevel::Error),
            "OFF" | "NONE" | "0" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A key-value field in a structured log entry.
#[derive(Debug, Clone)]
pub struct LogField {
    /// Field key.
    pub key: String,
    /// Field value.
    pub value: LogValue,
}

/// A value in a structured log entry.
#[derive(Debug, Clone)]
pub enum LogValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::String(s) => write!(f, "{}", s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl LogValue {
    fn to_json(&self) -> String {
        match self {
            LogValue::String(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Int(i) => i.to_string(),
            LogValue::Bool(b) => b.to_string(),
        }
    }
}

/// A named, timed region of a fiber's execution.
#[derive(Debug, Clone)]
pub struct LogSpan {
    /// Span label.
    pub label: String,
    /// When the span was entered.
    pub start: Instant,
}

impl LogSpan {
    /// Open a span now.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }
}

/// A rendered log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured fields.
    pub fields: Vec<LogField>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Fiber that logged.
    pub fiber: Option<FiberId>,
    /// Source location of the log call.
    pub location: Option<String>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            fiber: None,
            location: None,
        }
    }

    /// Add a field.
    pub fn with_field(mut self, key: impl Into<String>, value: LogValue) -> Self {
        self.fields.push(LogField {
            key: key.into(),
            value,
        });
        self
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = String::new();

        let secs = self.timestamp / 1000;
        let millis = self.timestamp % 1000;
        output.push_str(&format!("[{}.{:03}] ", secs, millis));
        output.push_str(&format!("{:<5} ", self.level.as_str()));

        if let Some(fiber) = &self.fiber {
            output.push_str(&format!("({}) ", fiber));
        }
        if let Some(location) = &self.location {
            output.push_str(&format!("[{}] ", location));
        }

        output.push_str(&self.message);

        if !self.fields.is_empty() {
            output.push_str(" {");
            for (i, field) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push_str(", ");
                }
                output.push_str(&format!("{}={}", field.key, field.value));
            }
            output.push('}');
        }

        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = String::from("{");

        output.push_str(&format!("\"timestamp\":{}", self.timestamp));
        output.push_str(&format!(",\"level\":\"{}\"", self.level.as_str()));

        if let Some(fiber) = &self.fiber {
            output.push_str(&format!(",\"fiber\":{}", fiber.seq()));
        }
        if let Some(location) = &self.location {
            output.push_str(&format!(",\"location\":\"{}\"", escape_json(location)));
        }

        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));

        if !self.fields.is_empty() {
            output.push_str(",\"fields\":{");
            for (i, field) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                output.push_str(&format!(
                    "\"{}\":{}",
                    escape_json(&field.key),
                    field.value.to_json()
                ));
            }
            output.push('}');
        }

        output.push('}');
        output
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

/// Escape a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Everything a logger learns about one `Log` instruction.
pub struct LogRecord<'a> {
    /// Where the log effect was built.
    pub location: &'static Location<'static>,
    /// The logging fiber.
    pub fiber_id: FiberId,
    /// Level of the record.
    pub level: LogLevel,
    /// Renders the message.
    pub message: &'a dyn Fn() -> String,
    /// Renders the attached cause, if any.
    pub cause: &'a dyn Fn() -> Option<String>,
    /// The fiber's refs at the time of the call.
    pub context: &'a FiberRefs,
    /// Open spans, outermost first.
    pub spans: &'a [LogSpan],
    /// Annotations in force.
    pub annotations: &'a BTreeMap<String, String>,
}

impl LogRecord<'_> {
    /// Render into a [`LogEntry`]: annotations become string fields, spans
    /// become `<label>=<elapsed>ms`, and a cause is added as `cause`.
    pub fn to_entry(&self) -> LogEntry {
        let mut entry = LogEntry::new(self.level, (self.message)());
        entry.fiber = Some(self.fiber_id);
        entry.location = Some(format!("{}:{}", self.location.file(), self.location.line()));
        for (key, value) in self.annotations {
            entry = entry.with_field(key.clone(), LogValue::String(value.clone()));
        }
        for span in self.spans {
            let elapsed = span.start.elapsed().as_millis() as i64;
            entry = entry.with_field(format!("{}_ms", span.label), LogValue::Int(elapsed));
        }
        if let Some(cause) = (self.cause)() {
            entry = entry.with_field("cause", LogValue::String(cause));
        }
        entry
    }
}

impl fmt::Debug for LogRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRecord")
            .field("location", &self.location)
            .field("fiber_id", &self.fiber_id)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Receives the records logged by fibers.
pub trait Logger: Send + Sync {
    /// Handle one record. Panics are caught by the interpreter.
    fn log(&self, record: &LogRecord<'_>);
}

/// Writes records at or above a minimum level to stderr.
#[derive(Debug, Clone)]
pub struct StderrLogger {
    min_level: LogLevel,
    format: LogFormat,
}

impl StderrLogger {
    /// Create a logger.
    pub fn new(min_level: LogLevel, format: LogFormat) -> Self {
        Self { min_level, format }
    }

    /// Check if a log level would be logged.
    pub fn would_log(&self, level: LogLevel) -> bool {
        self.min_level != LogLevel::Off && level != LogLevel::Off && level >= self.min_level
    }
}

impl Logger for StderrLogger {
    fn log(&self, record: &LogRecord<'_>) {
        if !self.would_log(record.level) {
            return;
        }
        let output = record.to_entry().format(self.format);
        let _ = writeln!(std::io::stderr().lock(), "{}", output);
    }
}

/// Forwards records to `tracing` under the `filament` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, record: &LogRecord<'_>) {
        let fiber = record.fiber_id.seq();
        let location = format!("{}:{}", record.location.file(), record.location.line());
        let spans: Vec<&str> = record.spans.iter().map(|s| s.label.as_str()).collect();
        let cause = (record.cause)();
        let message = (record.message)();
        match record.level {
            LogLevel::Trace => tracing::trace!(target: "filament", fiber, %location, ?spans, annotations = ?record.annotations, ?cause, "{}", message),
            LogLevel::Debug => tracing::debug!(target: "filament", fiber, %location, ?spans, annotations = ?record.annotations, ?cause, "{}", message),
            LogLevel::Info => tracing::info!(target: "filament", fiber, %location, ?spans, annotations = ?record.annotations, ?cause, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "filament", fiber, %location, ?spans, annotations = ?record.annotations, ?cause, "{}", message),
            LogLevel::Error => tracing::error!(target: "filament", fiber, %location, ?spans, annotations = ?record.annotations, ?cause, "{}", message),
            LogLevel::Off => {}
        }
    }
}
