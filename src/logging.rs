//! Component H — structured logger.
//!
//! A five-column table (timestamp, status, type, command/event, connection,
//! error/details) is both emitted through `tracing` (so it lands on
//! whichever stream — stdout or stderr — the process was configured for,
//! matching the teacher's `tracing_subscriber` setup in `main.rs`) and kept
//! in a bounded ring buffer that `/logs` serves directly (§4.5, §4.9).

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// e.g. "brop_command", "cdp_event", "extension", "async-skipped"
    pub kind: String,
    /// The command or event name this line is about, e.g. "Target.createTarget".
    pub subject: String,
    /// Connection label (client id / "extension" / "-").
    pub connection: String,
    /// Free-form detail or error message.
    pub detail: String,
}

pub struct EventLog {
    capacity: usize,
    records: Mutex<VecDeque<LogRecord>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn record(
        &self,
        level: LogLevel,
        kind: &str,
        subject: &str,
        connection: &str,
        detail: &str,
    ) {
        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            kind: kind.to_string(),
            subject: subject.to_string(),
            connection: connection.to_string(),
            detail: detail.to_string(),
        };

        match level {
            LogLevel::Debug => tracing::debug!(
                kind = %record.kind, subject = %record.subject, connection = %record.connection,
                "{}", record.detail
            ),
            LogLevel::Info => tracing::info!(
                kind = %record.kind, subject = %record.subject, connection = %record.connection,
                "{}", record.detail
            ),
            LogLevel::Warn => tracing::warn!(
                kind = %record.kind, subject = %record.subject, connection = %record.connection,
                "{}", record.detail
            ),
            LogLevel::Error => tracing::error!(
                kind = %record.kind, subject = %record.subject, connection = %record.connection,
                "{}", record.detail
            ),
        }

        let mut records = self.records.lock().expect("log mutex poisoned");
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot the ring buffer, most recent last, optionally filtered by
    /// minimum level and truncated to the last `limit` entries (`/logs`
    /// query params, §4.5).
    pub fn snapshot(&self, limit: Option<usize>, min_level: Option<LogLevel>) -> Vec<LogRecord> {
        let records = self.records.lock().expect("log mutex poisoned");
        let mut filtered: Vec<LogRecord> = records
            .iter()
            .filter(|r| min_level.map(|lvl| r.level >= lvl).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let len = filtered.len();
            if len > limit {
                filtered = filtered.split_off(len - limit);
            }
        }
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_bounded() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.record(LogLevel::Info, "test", &format!("m{i}"), "-", "");
        }
        assert_eq!(log.snapshot(None, None).len(), 3);
        // oldest entries should have been evicted
        let snap = log.snapshot(None, None);
        assert_eq!(snap[0].subject, "m2");
    }

    #[test]
    fn snapshot_limit_keeps_most_recent() {
        let log = EventLog::new(10);
        for i in 0..5 {
            log.record(LogLevel::Info, "test", &format!("m{i}"), "-", "");
        }
        let snap = log.snapshot(Some(2), None);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].subject, "m4");
    }

    #[test]
    fn snapshot_filters_by_level() {
        let log = EventLog::new(10);
        log.record(LogLevel::Debug, "t", "d", "-", "");
        log.record(LogLevel::Error, "t", "e", "-", "");
        let snap = log.snapshot(None, Some(LogLevel::Warn));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].subject, "e");
    }
}
