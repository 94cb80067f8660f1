//! Testing utilities for telemetry and job logging
//!
//! Transports with scripted behaviour (capturing, stalling, failing) and a
//! [`RecordingSink`] fallback so tests can observe what a [`JobLogger`]
//! forwarded without touching the network or the tracing subscriber.
//!
//! [`JobLogger`]: crate::JobLogger

use crate::event::TelemetryRecord;
use crate::level::LogLevel;
use crate::logger::{LogSink, LoggerError};
use crate::transport::{TelemetryTransport, TransportError};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Transport that keeps every delivered record in memory
///
/// Clones share the same buffer, so a test keeps one clone and hands the
/// other to the pipeline.
#[derive(Clone, Default)]
pub struct CaptureTransport {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl CaptureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Records whose message contains `needle`
    pub fn find(&self, needle: &str) -> Vec<TelemetryRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message().contains(needle))
            .collect()
    }
}

impl TelemetryTransport for CaptureTransport {
    fn send(&mut self, batch: &[TelemetryRecord]) -> Result<(), TransportError> {
        self.records.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "capture"
    }
}

/// Transport that rejects every batch
#[derive(Clone, Default)]
pub struct FailingTransport {
    attempts: Arc<Mutex<usize>>,
}

impl FailingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivery attempts seen
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl TelemetryTransport for FailingTransport {
    fn send(&mut self, _batch: &[TelemetryRecord]) -> Result<(), TransportError> {
        *self.attempts.lock().unwrap() += 1;
        Err(TransportError::Unavailable("scripted failure".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[derive(Default)]
struct StallState {
    entered: bool,
    released: bool,
}

/// Transport whose `send` blocks until [`release`](Self::release) is called
///
/// Models an ingestion endpoint that never answers.
#[derive(Clone, Default)]
pub struct StalledTransport {
    state: Arc<(Mutex<StallState>, Condvar)>,
}

impl StalledTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the worker is stuck inside `send`, or the timeout passes
    pub fn wait_until_entered(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.state;
        let guard = lock.lock().unwrap();
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |s| !s.entered)
            .unwrap();
        guard.entered
    }

    /// Let every blocked and future `send` return
    pub fn release(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().released = true;
        cvar.notify_all();
    }
}

impl TelemetryTransport for StalledTransport {
    fn send(&mut self, _batch: &[TelemetryRecord]) -> Result<(), TransportError> {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        guard.entered = true;
        cvar.notify_all();
        while !guard.released {
            guard = cvar.wait(guard).unwrap();
        }
        Err(TransportError::Unavailable("stalled".to_string()))
    }

    fn name(&self) -> &'static str {
        "stalled"
    }
}

/// What a [`RecordingSink`] saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEntry {
    Log(LogLevel, String),
    Panic(String),
}

/// Fallback sink that records calls in memory
#[derive(Clone)]
pub struct RecordingSink {
    minimum: LogLevel,
    entries: Arc<Mutex<Vec<SinkEntry>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_minimum(LogLevel::Debug)
    }

    pub fn with_minimum(minimum: LogLevel) -> Self {
        Self {
            minimum,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn entries(&self) -> Vec<SinkEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Messages passed to `panic`
    pub fn panics(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                SinkEntry::Panic(msg) => Some(msg),
                SinkEntry::Log(..) => None,
            })
            .collect()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for RecordingSink {
    fn should_log(&self, level: LogLevel) -> bool {
        level.passes(self.minimum)
    }

    fn log(&self, level: LogLevel, message: &str) -> Result<(), LoggerError> {
        if self.should_log(level) {
            self.entries
                .lock()
                .unwrap()
                .push(SinkEntry::Log(level, message.to_string()));
        }
        Ok(())
    }

    fn panic(&self, error: &(dyn std::error::Error + 'static)) -> Result<(), LoggerError> {
        self.entries
            .lock()
            .unwrap()
            .push(SinkEntry::Panic(error.to_string()));
        Ok(())
    }
}

/// Read a job log file and strip the `YYYY/MM/DD HH:MM:SS ` prefix
pub fn read_log_messages(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| line.get(20..).unwrap_or("").to_string())
        .collect()
}
