/*!
 * Integration tests for job logging
 *
 * Drives job loggers through `LoggingContext` the way a transfer job would:
 * open, log directly and through tracing, report body-read retries, close.
 */

use cirrus::{
    config::EngineConfig,
    core::new_read_log_fn,
    logging::LoggingContext,
};
use cirrus_observability::{
    testing::{read_log_messages, RecordingSink},
    InstrumentationKey, JobId, JobLogLayer, LogLevel, LogSink, LoggerError, LoggerState,
    PipelineState, ShutdownOutcome, TelemetryRecord,
};
use std::io;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing_subscriber::layer::SubscriberExt;

fn config_in(dir: &TempDir, level: LogLevel) -> EngineConfig {
    EngineConfig {
        log_level: level,
        log_folder: dir.path().join("logs"),
        ..Default::default()
    }
}

#[test]
fn test_job_log_lifecycle() {
    let dir = TempDir::new().unwrap();
    let ctx = LoggingContext::new(config_in(&dir, LogLevel::Info));
    let job_id = JobId::new();
    let logger = ctx.job_logger(job_id);

    assert_eq!(
        logger.path(),
        dir.path().join("logs").join(format!("{}.log", job_id))
    );
    assert!(matches!(
        logger.log(LogLevel::Info, "too early"),
        Err(LoggerError::NotOpened)
    ));

    logger.open().unwrap();
    logger.log(LogLevel::Info, "Scanning source").unwrap();
    logger.log(LogLevel::Debug, "hidden detail").unwrap();
    logger
        .log(LogLevel::Error, "Failed https://acct/c/b?sig=abcdef&sv=1")
        .unwrap();
    assert!(logger.close().unwrap().is_none());
    assert_eq!(logger.state(), LoggerState::Closed);

    let lines = read_log_messages(logger.path());
    assert!(lines[0].starts_with("CirrusVersion "));
    assert!(lines[1].starts_with("OS-Environment "));
    assert!(lines[2].starts_with("OS-Architecture "));
    assert_eq!(lines[3], "Scanning source");
    assert_eq!(lines[4], "Failed https://acct/c/b?sig=REDACTED&sv=1");
    assert_eq!(lines.last().map(String::as_str), Some("Closing Log"));
    assert!(!lines.iter().any(|l| l.contains("hidden detail")));

    assert!(matches!(logger.close(), Err(LoggerError::Closed)));
    assert!(matches!(
        logger.log(LogLevel::Error, "too late"),
        Err(LoggerError::Closed)
    ));
}

#[test]
fn test_concurrent_writers_keep_lines_whole() {
    let dir = TempDir::new().unwrap();
    let ctx = LoggingContext::new(config_in(&dir, LogLevel::Debug));
    let logger = ctx.job_logger(JobId::new());
    logger.open().unwrap();

    let writers: Vec<_> = (0..8)
        .map(|t| {
            let logger = Arc::clone(&logger);
            thread::spawn(move || {
                for i in 0..50 {
                    logger
                        .log(LogLevel::Info, &format!("writer {} line {}", t, i))
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    logger.close().unwrap();

    let lines = read_log_messages(logger.path());
    let body: Vec<_> = lines.iter().filter(|l| l.starts_with("writer ")).collect();
    assert_eq!(body.len(), 400);
    assert!(body.iter().all(|l| l.split(' ').count() == 4));
}

#[test]
fn test_retry_callback_writes_to_job_log() {
    let dir = TempDir::new().unwrap();
    let ctx = LoggingContext::new(config_in(&dir, LogLevel::Info));
    let logger = ctx.job_logger(JobId::new());
    logger.open().unwrap();

    let sink: Arc<dyn LogSink> = logger.clone();
    let callback = new_read_log_fn(sink, "https://acct/c/big?se=2030&sig=c2VjcmV0");
    let err = io::Error::new(io::ErrorKind::TimedOut, "read timed out");
    callback(1, &err, 1024, 2048, true);
    callback(5, &err, 1024, 2048, false);
    logger.close().unwrap();

    let lines = read_log_messages(logger.path());
    let retries: Vec<_> = lines
        .iter()
        .filter(|l| l.starts_with("Error reading body of reply."))
        .collect();
    assert_eq!(retries.len(), 2);
    assert!(retries[0].contains("Try=2. Will retry."));
    assert!(retries[1].contains("Try=6. Will NOT retry."));
    assert!(retries.iter().all(|l| l.ends_with("sig=REDACTED")));
    assert!(!lines.iter().any(|l| l.contains("c2VjcmV0")));
}

#[test]
fn test_tracing_events_bridged_into_job_log() {
    let dir = TempDir::new().unwrap();
    let layer = JobLogLayer::new();
    let ctx = LoggingContext::new(config_in(&dir, LogLevel::Info))
        .with_job_registry(layer.registry());
    let job_id = JobId::new();
    let logger = ctx.job_logger(job_id);
    logger.open().unwrap();

    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        let span = tracing::info_span!("job", job_id = %job_id);
        let _guard = span.enter();
        tracing::warn!(attempt = 2u32, "Throttled by server");
    });
    logger.close().unwrap();

    let lines = read_log_messages(logger.path());
    assert!(lines.contains(&"Throttled by server attempt=2".to_string()));
}

#[test]
fn test_panic_reaches_file_and_fallback() {
    let dir = TempDir::new().unwrap();
    let fallback = RecordingSink::new();
    let ctx = LoggingContext::new(config_in(&dir, LogLevel::Error))
        .with_fallback(Arc::new(fallback.clone()));
    let logger = ctx.job_logger(JobId::new());
    logger.open().unwrap();

    let err = io::Error::other("disk vanished");
    logger.panic(&err).unwrap();
    logger.close().unwrap();

    assert!(read_log_messages(logger.path()).contains(&"disk vanished".to_string()));
    assert_eq!(fallback.panics(), vec!["disk vanished".to_string()]);
}

#[test]
fn test_level_none_creates_no_file() {
    let dir = TempDir::new().unwrap();
    let ctx = LoggingContext::new(config_in(&dir, LogLevel::None));
    let logger = ctx.job_logger(JobId::new());

    logger.open().unwrap();
    logger.log(LogLevel::Fatal, "dropped").unwrap();
    logger.close().unwrap();
    assert!(!logger.path().exists());
}

#[test]
fn test_telemetry_spooled_and_closed_by_last_job() {
    let dir = TempDir::new().unwrap();
    let spool = dir.path().join("telemetry.jsonl");
    let mut config = config_in(&dir, LogLevel::Info);
    config.telemetry.enabled = true;
    config.telemetry.instrumentation_key = InstrumentationKey::new("integration-key");
    config.telemetry.spool_path = Some(spool.clone());

    let ctx = LoggingContext::new(config);
    let first = ctx.job_logger(JobId::new());
    let second = ctx.job_logger(JobId::new());
    first.open().unwrap();
    second.open().unwrap();
    first
        .log(LogLevel::Warning, "first job https://h/p?token=s3cr3t")
        .unwrap();
    second.log(LogLevel::Info, "second job").unwrap();

    assert!(first.close().unwrap().is_none());
    assert_eq!(ctx.telemetry_state(), PipelineState::Open);
    let outcome = second.close().unwrap();
    assert!(matches!(outcome, Some(ShutdownOutcome::Drained { .. })));
    assert_eq!(ctx.telemetry_state(), PipelineState::Closed);

    let spooled = std::fs::read_to_string(&spool).unwrap();
    assert!(!spooled.contains("s3cr3t"));
    let records: Vec<TelemetryRecord> = spooled
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let first_id = first.job_id().to_string();
    let second_id = second.job_id().to_string();
    assert!(records
        .iter()
        .any(|r| r.session_id == first_id && r.message() == "first job https://h/p?token=REDACTED"));
    assert!(records
        .iter()
        .any(|r| r.session_id == second_id && r.message() == "second job"));
}
