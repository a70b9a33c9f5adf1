//! Structured JSON transfer events for jq parsing
//!
//! When enabled on the listener, every session transition is also written to
//! stdout as one JSON object per line, next to the regular `log` output.

use crate::engine::EngineStats;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp (RFC3339)
    pub timestamp: String,

    pub level: LogLevel,

    /// Component name ("engine", "listener", "sender")
    pub component: String,

    pub message: String,

    /// Event fields
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339(SystemTime::now()).to_string(),
            level,
            component: component.into(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Add key-value pair to data
    pub fn add_field(mut self, key: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.data {
            map.insert(key.to_string(), value);
        } else {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), value);
            self.data = serde_json::Value::Object(map);
        }
        self
    }

    pub fn to_line(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Output as JSON line
    pub fn emit(&self) {
        if let Some(json) = self.to_line() {
            println!("{}", json);
        }
    }
}

/// Transfer event logger
pub struct JsonLogger;

impl JsonLogger {
    /// Listener bound and serving
    pub fn listener_start(component: impl Into<String>, addr: &str, base_domain: &str, policy: &str) {
        let data = serde_json::json!({
            "event_type": "listener_start",
            "addr": addr,
            "base_domain": base_domain,
            "key_policy": policy,
        });

        LogEntry::new(LogLevel::Info, component, "Listener started")
            .with_data(data)
            .emit();
    }

    /// Listener shutting down, with the final counters
    pub fn listener_stop(component: impl Into<String>, stats: &EngineStats) {
        LogEntry::new(LogLevel::Info, component, "Listener stopped")
            .add_field("event_type", serde_json::json!("listener_stop"))
            .add_field("stats", serde_json::to_value(stats).unwrap_or_default())
            .emit();
    }

    /// Path announcement opened (or reset) a session
    pub fn session_start(component: impl Into<String>, key: &str, path: &str, replaced: bool) {
        let data = serde_json::json!({
            "event_type": "session_start",
            "session": key,
            "path": path,
            "replaced": replaced,
        });

        LogEntry::new(LogLevel::Info, component, "Session started")
            .with_data(data)
            .emit();
    }

    /// A chunk or EOF was discarded
    pub fn message_dropped(component: impl Into<String>, key: &str, qname: &str, reason: &str) {
        let data = serde_json::json!({
            "event_type": "message_dropped",
            "session": key,
            "qname": qname,
            "reason": reason,
        });

        LogEntry::new(LogLevel::Warn, component, "Message dropped")
            .with_data(data)
            .emit();
    }

    /// Session flushed to disk
    pub fn session_flushed(
        component: impl Into<String>,
        key: &str,
        output: &str,
        bytes: usize,
        chunks: usize,
        missing: &[u64],
    ) {
        let data = serde_json::json!({
            "event_type": "session_flushed",
            "session": key,
            "output": output,
            "bytes": bytes,
            "chunks": chunks,
            "missing": missing,
        });

        let level = if missing.is_empty() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };

        LogEntry::new(level, component, "Session flushed")
            .with_data(data)
            .emit();
    }

    /// Flush could not write the output file
    pub fn flush_failed(component: impl Into<String>, key: &str, output: &str, error: &str) {
        let data = serde_json::json!({
            "event_type": "flush_failed",
            "session": key,
            "output": output,
            "error": error,
        });

        LogEntry::new(LogLevel::Error, component, "Flush failed")
            .with_data(data)
            .emit();
    }
}
