//! Telemetry record schema
//!
//! A job log line that reaches the telemetry pipeline becomes a
//! [`TelemetryRecord`]. Error and panic lines are shipped as exception
//! records; every other level is shipped as a generic log event.

use crate::level::LogLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name given to generic log events
pub const LOG_EVENT_NAME: &str = "log event";

/// One unit of telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Session the record belongs to (the job identifier)
    pub session_id: String,

    /// Event timestamp (UTC)
    pub timestamp: DateTime<Utc>,

    /// Severity tag
    pub level: LogLevel,

    /// Record body
    pub body: RecordBody,
}

/// Record payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    /// Generic log event
    Event { name: String, message: String },

    /// Error or panic, carrying the message as the error payload
    Exception { error: String },
}

impl TelemetryRecord {
    /// Classify a log line into an event or exception record stamped now
    pub fn from_log(session_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        let body = if level.is_exception() {
            RecordBody::Exception { error: message }
        } else {
            RecordBody::Event {
                name: LOG_EVENT_NAME.to_string(),
                message,
            }
        };

        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            level,
            body,
        }
    }

    /// Message text regardless of record kind
    pub fn message(&self) -> &str {
        match &self.body {
            RecordBody::Event { message, .. } => message,
            RecordBody::Exception { error } => error,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.body, RecordBody::Exception { .. })
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self.body {
            RecordBody::Event { .. } => "event",
            RecordBody::Exception { .. } => "exception",
        }
    }
}

/// Batch shipped to an ingestion endpoint
#[derive(Debug, Serialize)]
pub struct TelemetryEnvelope<'a> {
    pub sent_at: DateTime<Utc>,
    pub records: &'a [TelemetryRecord],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_becomes_event() {
        let record = TelemetryRecord::from_log("job-1", LogLevel::Info, "hello");
        assert_eq!(
            record.body,
            RecordBody::Event {
                name: LOG_EVENT_NAME.to_string(),
                message: "hello".to_string()
            }
        );
        assert_eq!(record.kind(), "event");
        assert!(record.timestamp <= Utc::now());
    }

    #[test]
    fn test_error_and_panic_become_exceptions() {
        for level in [LogLevel::Error, LogLevel::Panic] {
            let record = TelemetryRecord::from_log("job-1", level, "boom");
            assert!(record.is_exception());
            assert_eq!(record.message(), "boom");
        }
        assert!(!TelemetryRecord::from_log("j", LogLevel::Fatal, "x").is_exception());
    }

    #[test]
    fn test_serialization_shape() {
        let record = TelemetryRecord::from_log("job-7", LogLevel::Panic, "disk gone");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"session_id\":\"job-7\""));
        assert!(json.contains("\"level\":\"PANIC\""));
        assert!(json.contains("\"kind\":\"exception\""));
        assert!(json.contains("\"error\":\"disk gone\""));

        let back: TelemetryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
