//! Cirrus job logging and telemetry
//!
//! This crate records what a transfer job did, durably and safely:
//! - **Job logs**: one append-only file per job with UTC-timestamped lines
//! - **Secret redaction** applied to every message before it leaves the process
//! - **Telemetry** shipped in the background, with a bounded-time shutdown
//! - **Prometheus metrics** for log volume and telemetry delivery
//!
//! ## Quick Start
//!
//! ```no_run
//! use cirrus_observability::{
//!     InstrumentationKey, JobId, JobLogger, LogLevel, LogSink, TelemetryConfig,
//!     TelemetryPipeline, TracingSink,
//! };
//! use std::sync::Arc;
//!
//! let job_id = JobId::new();
//!
//! // 1. Start telemetry if it is switched on and a key is configured
//! let config = TelemetryConfig {
//!     enabled: true,
//!     endpoint: Some("https://ingest.example.com/v2/track".to_string()),
//!     instrumentation_key: InstrumentationKey::new("my-key"),
//!     ..Default::default()
//! };
//! let pipeline = TelemetryPipeline::from_config(&config, &job_id.to_string()).unwrap();
//!
//! // 2. One logger per job, with a process-level fallback for panics
//! let mut logger = JobLogger::new(job_id, LogLevel::Info, "logs", Arc::new(TracingSink));
//! if let Some(ref pipeline) = pipeline {
//!     logger = logger.with_telemetry(pipeline);
//! }
//!
//! logger.open().unwrap();
//! logger.log(LogLevel::Info, "transfer started").unwrap();
//!
//! // 3. Closing the last logger flushes telemetry, waiting at most the hard timeout
//! let outcome = logger.close().unwrap();
//! println!("telemetry shutdown: {:?}", outcome);
//! ```
//!
//! ## Bounded shutdown
//!
//! ```text
//! close request ──┬── worker drains + retries ──── soft timeout (10s)
//!                 └── caller waits ─────────────── hard timeout (30s)
//! ```
//!
//! The hard timer starts with the close request and is independent of the
//! soft one, so shutdown never takes longer than the hard timeout.

pub mod event;
pub mod job;
pub mod level;
pub mod logger;
pub mod sanitizer;
pub mod telemetry;
pub mod transport;

pub mod bridge;
pub mod fallback;
pub mod metrics;

pub mod testing;

pub use bridge::{JobLogLayer, JobLogRegistry};
pub use event::{RecordBody, TelemetryRecord};
pub use fallback::TracingSink;
pub use job::JobId;
pub use level::{LogLevel, ParseLevelError};
pub use logger::{JobLogger, LogSink, LoggerError, LoggerState};
pub use sanitizer::{redact_secret_query_params, Sanitizer, SecretRedactor, REDACTED};
pub use telemetry::{
    InstrumentationKey, PipelineState, ShutdownOutcome, TelemetryConfig, TelemetryError,
    TelemetryLease, TelemetryPipeline,
};
pub use transport::{HttpTransport, JsonLinesTransport, TelemetryTransport, TransportError};

/// Prelude module for convenient imports
///
/// ```
/// use cirrus_observability::prelude::*;
/// ```
pub mod prelude {
    pub use crate::job::JobId;
    pub use crate::level::LogLevel;
    pub use crate::logger::{JobLogger, LogSink};
    pub use crate::sanitizer::Sanitizer;
    pub use crate::telemetry::{TelemetryConfig, TelemetryPipeline};
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::testing::{read_log_messages, RecordingSink};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_spooled_telemetry_end_to_end() {
        let dir = TempDir::new().unwrap();
        let spool = dir.path().join("telemetry").join("spool.jsonl");
        let config = TelemetryConfig {
            enabled: true,
            spool_path: Some(spool.clone()),
            instrumentation_key: InstrumentationKey::new("integration"),
            ..Default::default()
        };

        let job_id = JobId::new();
        let pipeline = TelemetryPipeline::from_config(&config, &job_id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.transport_name(), "json-lines");

        let logger = JobLogger::new(job_id, LogLevel::Info, dir.path(), Arc::new(RecordingSink::new()))
            .with_telemetry(&pipeline);
        logger.open().unwrap();
        logger
            .log(LogLevel::Warning, "retrying https://h/p?token=abc123")
            .unwrap();
        let outcome = logger.close().unwrap();
        assert!(matches!(outcome, Some(ShutdownOutcome::Drained { delivered: 4 })));

        let spooled = std::fs::read_to_string(&spool).unwrap();
        let records: Vec<TelemetryRecord> = spooled
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.session_id == job_id.to_string()));
        assert!(!spooled.contains("abc123"));

        let lines = read_log_messages(logger.path());
        assert!(lines.contains(&"retrying https://h/p?token=REDACTED".to_string()));
    }

    #[test]
    fn test_shutdown_bounded_when_endpoint_never_answers() {
        let stalled = testing::StalledTransport::new();
        let config = TelemetryConfig {
            enabled: true,
            instrumentation_key: InstrumentationKey::new("k"),
            flush_interval_ms: 10,
            ..Default::default()
        };
        let pipeline = TelemetryPipeline::start(&config, Box::new(stalled.clone()), "job").unwrap();
        pipeline.record_event(LogLevel::Info, "never acknowledged");
        assert!(stalled.wait_until_entered(Duration::from_secs(5)));

        let started = std::time::Instant::now();
        let outcome = pipeline.flush_and_close(Duration::from_millis(50), Duration::from_millis(250));
        assert_eq!(outcome, ShutdownOutcome::HardTimeout);
        assert!(started.elapsed() < Duration::from_secs(2));
        stalled.release();
    }

    #[test]
    fn test_metrics_registration() {
        let _ = metrics::registry();
        metrics::inc_log_line("INFO");
        metrics::inc_telemetry_dropped(1);

        let output = metrics::metrics_text();
        assert!(output.contains("cirrus_job_log_lines_total"));
        assert!(output.contains("cirrus_telemetry_dropped_total"));
    }
}
