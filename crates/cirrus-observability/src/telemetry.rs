//! Telemetry pipeline with bounded-time shutdown
//!
//! A [`TelemetryPipeline`] is an explicitly owned, shared handle
//! (`Arc<TelemetryPipeline>`) around a background delivery worker. Job loggers
//! submit records without waiting on the network; the worker batches them and
//! hands them to a [`TelemetryTransport`].
//!
//! ## Shutdown
//!
//! Every job logger holds a [`TelemetryLease`]. Releasing the last lease runs
//! [`TelemetryPipeline::flush_and_close`], which:
//!
//! 1. asks the worker to deliver everything still queued, retrying failed
//!    batches for at most the *soft* timeout, and
//! 2. independently waits at most the *hard* timeout measured from the close
//!    request, after which it stops waiting whatever the worker is doing.
//!
//! Close is one-shot: an atomic guard makes every call after the first return
//! [`ShutdownOutcome::AlreadyClosed`] without touching the worker.

use crate::event::TelemetryRecord;
use crate::level::LogLevel;
use crate::metrics;
use crate::transport::{HttpTransport, JsonLinesTransport, TelemetryTransport, TransportError};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variable holding the instrumentation key
pub const INSTRUMENTATION_KEY_ENV: &str = "CIRRUS_TELEMETRY_KEY";

/// Environment variable holding the ingestion endpoint
pub const ENDPOINT_ENV: &str = "CIRRUS_TELEMETRY_ENDPOINT";

/// Default retry window granted to the worker on close
pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default absolute bound on how long close waits
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while starting a pipeline
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry is enabled but neither an endpoint nor a spool path is configured")]
    NoTransport,

    #[error("failed to open telemetry transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to spawn telemetry worker: {0}")]
    Spawn(std::io::Error),
}

/// Secret used to authenticate with the ingestion endpoint
///
/// `Debug` never prints the key itself.
#[derive(Clone, PartialEq, Eq)]
pub struct InstrumentationKey(String);

impl InstrumentationKey {
    /// Returns `None` for an empty or blank key
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstrumentationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InstrumentationKey(REDACTED)")
    }
}

/// Telemetry settings
///
/// The pipeline only starts when `enabled` is set *and* an instrumentation
/// key is present. The key is never serialized; it comes from
/// [`INSTRUMENTATION_KEY_ENV`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,

    /// HTTP ingestion endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Write records to this JSON Lines file instead of posting them
    #[serde(default)]
    pub spool_path: Option<PathBuf>,

    #[serde(skip)]
    pub instrumentation_key: Option<InstrumentationKey>,

    /// Retry window granted to the worker on close, in seconds
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,

    /// Absolute bound on close, in seconds, measured from the close request
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,

    /// Maximum records per delivered batch
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Capacity of the submission queue; records beyond it are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often the worker ships a partial batch, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_soft_timeout_secs() -> u64 {
    DEFAULT_SOFT_TIMEOUT.as_secs()
}

fn default_hard_timeout_secs() -> u64 {
    DEFAULT_HARD_TIMEOUT.as_secs()
}

fn default_max_batch() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    8192
}

fn default_flush_interval_ms() -> u64 {
    2_000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            spool_path: None,
            instrumentation_key: None,
            soft_timeout_secs: default_soft_timeout_secs(),
            hard_timeout_secs: default_hard_timeout_secs(),
            max_batch: default_max_batch(),
            queue_capacity: default_queue_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl TelemetryConfig {
    /// Switch on and key present
    pub fn is_active(&self) -> bool {
        self.enabled && self.instrumentation_key.is_some()
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Build the transport this configuration describes
    pub fn build_transport(&self) -> Result<Box<dyn TelemetryTransport>, TelemetryError> {
        if let Some(ref path) = self.spool_path {
            return Ok(Box::new(JsonLinesTransport::open(path)?));
        }
        match (&self.endpoint, &self.instrumentation_key) {
            (Some(endpoint), Some(key)) => {
                Ok(Box::new(HttpTransport::new(endpoint.clone(), key.expose())))
            }
            _ => Err(TelemetryError::NoTransport),
        }
    }
}

/// Lifecycle of the process telemetry pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nobody has asked for telemetry yet
    Uninitialized,
    /// Switched off or no instrumentation key
    Disabled,
    /// Accepting records
    Open,
    /// Flushed and closed
    Closed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Disabled => "disabled",
            PipelineState::Open => "open",
            PipelineState::Closed => "closed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a call to [`TelemetryPipeline::flush_and_close`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every queued record was delivered
    Drained { delivered: usize },
    /// The worker gave up retrying when the soft timeout ran out
    RetryWindowExpired { delivered: usize, abandoned: usize },
    /// The worker did not report back before the hard timeout
    HardTimeout,
    /// The worker had already exited
    Disconnected,
    /// Another caller closed the pipeline first
    AlreadyClosed,
}

impl ShutdownOutcome {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::Drained { .. } => "drained",
            ShutdownOutcome::RetryWindowExpired { .. } => "retry_window_expired",
            ShutdownOutcome::HardTimeout => "hard_timeout",
            ShutdownOutcome::Disconnected => "disconnected",
            ShutdownOutcome::AlreadyClosed => "already_closed",
        }
    }
}

/// Worker's account of the final drain
#[derive(Debug, Clone, Copy)]
struct DrainReport {
    delivered: usize,
    abandoned: usize,
}

enum Command {
    Record(TelemetryRecord),
    Flush,
    Close {
        retry_window: Duration,
        done: Sender<DrainReport>,
    },
}

/// Shared telemetry pipeline
pub struct TelemetryPipeline {
    sender: Sender<Command>,
    session: RwLock<String>,
    closed: AtomicBool,
    leases: Mutex<Leases>,
    worker: Mutex<Option<JoinHandle<()>>>,
    soft_timeout: Duration,
    hard_timeout: Duration,
    transport_name: &'static str,
}

impl TelemetryPipeline {
    /// Start a pipeline if the configuration allows it
    ///
    /// Returns `Ok(None)` when telemetry is switched off or no key is set.
    pub fn from_config(
        config: &TelemetryConfig,
        session_id: &str,
    ) -> Result<Option<Arc<Self>>, TelemetryError> {
        if !config.is_active() {
            return Ok(None);
        }
        let transport = config.build_transport()?;
        Self::start(config, transport, session_id).map(Some)
    }

    /// Start a pipeline over an explicit transport
    pub fn start(
        config: &TelemetryConfig,
        transport: Box<dyn TelemetryTransport>,
        session_id: &str,
    ) -> Result<Arc<Self>, TelemetryError> {
        let (sender, receiver) = bounded(config.queue_capacity.max(1));
        let transport_name = transport.name();
        let worker = Worker {
            receiver,
            transport,
            pending: Vec::new(),
            max_batch: config.max_batch.max(1),
            max_pending: config.queue_capacity.max(1),
            flush_interval: config.flush_interval(),
        };

        let handle = thread::Builder::new()
            .name("cirrus-telemetry".to_string())
            .spawn(move || worker.run())
            .map_err(TelemetryError::Spawn)?;

        tracing::debug!(transport = transport_name, session = session_id, "Telemetry pipeline started");

        Ok(Arc::new(Self {
            sender,
            session: RwLock::new(session_id.to_string()),
            closed: AtomicBool::new(false),
            leases: Mutex::new(Leases::default()),
            worker: Mutex::new(Some(handle)),
            soft_timeout: config.soft_timeout(),
            hard_timeout: config.hard_timeout(),
            transport_name,
        }))
    }

    /// Bind the default session id used by [`record_event`](Self::record_event)
    pub fn bind_session(&self, session_id: &str) {
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        *session = session_id.to_string();
    }

    /// Currently bound session id
    pub fn session_id(&self) -> String {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> PipelineState {
        if self.closed.load(Ordering::Acquire) {
            PipelineState::Closed
        } else {
            PipelineState::Open
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport_name
    }

    /// Number of outstanding leases
    pub fn lease_count(&self) -> usize {
        self.lock_leases().held
    }

    fn lock_leases(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a log line under the bound session
    ///
    /// Returns whether the record was queued. Never blocks.
    pub fn record_event(&self, level: LogLevel, message: &str) -> bool {
        let session = self.session_id();
        self.record_event_for(&session, level, message)
    }

    /// Record a log line under an explicit session
    pub fn record_event_for(&self, session_id: &str, level: LogLevel, message: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            metrics::inc_telemetry_dropped(1);
            return false;
        }

        let record = TelemetryRecord::from_log(session_id, level, message);
        let kind = record.kind();
        match self.sender.try_send(Command::Record(record)) {
            Ok(()) => {
                metrics::inc_telemetry_queued(kind);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                metrics::inc_telemetry_dropped(1);
                false
            }
        }
    }

    /// Ask the worker to ship whatever it has buffered
    pub fn flush(&self) {
        let _ = self.sender.try_send(Command::Flush);
    }

    /// Take a lease; the pipeline closes when the last lease is released
    ///
    /// Returns `None` once the pipeline is closed or closing.
    pub fn acquire(self: &Arc<Self>) -> Option<TelemetryLease> {
        let mut leases = self.lock_leases();
        if leases.retired {
            return None;
        }
        leases.held += 1;
        Some(TelemetryLease {
            pipeline: Arc::clone(self),
            released: false,
        })
    }

    /// Flush and close with the configured timeouts
    pub fn close(&self) -> ShutdownOutcome {
        self.flush_and_close(self.soft_timeout, self.hard_timeout)
    }

    /// Flush, then wait for delivery with a soft retry window and a hard bound
    ///
    /// Returns no later than `hard` after the call, whatever the transport is
    /// doing.
    pub fn flush_and_close(&self, soft: Duration, hard: Duration) -> ShutdownOutcome {
        let requested = Instant::now();
        self.lock_leases().retired = true;
        if self.closed.swap(true, Ordering::AcqRel) {
            return ShutdownOutcome::AlreadyClosed;
        }

        let hard_deadline = crossbeam_channel::after(hard);
        let (done_tx, done_rx) = bounded(1);

        self.flush();
        let close = Command::Close {
            retry_window: soft,
            done: done_tx,
        };
        let remaining = hard.saturating_sub(requested.elapsed());

        let outcome = match self.sender.send_timeout(close, remaining) {
            Err(SendTimeoutError::Timeout(_)) => ShutdownOutcome::HardTimeout,
            Err(SendTimeoutError::Disconnected(_)) => ShutdownOutcome::Disconnected,
            Ok(()) => select! {
                recv(done_rx) -> report => match report {
                    Ok(report) if report.abandoned == 0 => ShutdownOutcome::Drained {
                        delivered: report.delivered,
                    },
                    Ok(report) => ShutdownOutcome::RetryWindowExpired {
                        delivered: report.delivered,
                        abandoned: report.abandoned,
                    },
                    Err(_) => ShutdownOutcome::Disconnected,
                },
                recv(hard_deadline) -> _ => ShutdownOutcome::HardTimeout,
            },
        };

        // The worker has returned (or is about to) unless we gave up on it
        if matches!(
            outcome,
            ShutdownOutcome::Drained { .. } | ShutdownOutcome::RetryWindowExpired { .. }
        ) {
            let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }

        metrics::record_shutdown(outcome.as_str());
        tracing::debug!(
            outcome = outcome.as_str(),
            elapsed_ms = requested.elapsed().as_millis() as u64,
            "Telemetry pipeline closed"
        );
        outcome
    }
}

impl fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryPipeline")
            .field("session", &self.session_id())
            .field("state", &self.state())
            .field("leases", &self.lease_count())
            .field("transport", &self.transport_name)
            .finish()
    }
}

/// Lease bookkeeping; `retired` is set once, before the close begins
#[derive(Debug, Default)]
struct Leases {
    held: usize,
    retired: bool,
}

/// A job logger's claim on the shared pipeline
///
/// Dropping a lease without [`release`](Self::release) gives up the claim but
/// never triggers the (blocking) close.
pub struct TelemetryLease {
    pipeline: Arc<TelemetryPipeline>,
    released: bool,
}

impl TelemetryLease {
    pub fn pipeline(&self) -> &Arc<TelemetryPipeline> {
        &self.pipeline
    }

    /// Give up the claim; the last holder flushes and closes the pipeline
    pub fn release(mut self) -> Option<ShutdownOutcome> {
        self.released = true;
        let last = {
            let mut leases = self.pipeline.lock_leases();
            leases.held = leases.held.saturating_sub(1);
            if leases.held == 0 {
                leases.retired = true;
            }
            leases.retired
        };
        // The lease lock is dropped before the blocking close
        last.then(|| self.pipeline.close())
    }
}

impl Drop for TelemetryLease {
    fn drop(&mut self) {
        if !self.released {
            let mut leases = self.pipeline.lock_leases();
            leases.held = leases.held.saturating_sub(1);
        }
    }
}

impl fmt::Debug for TelemetryLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryLease")
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Background delivery loop
struct Worker {
    receiver: Receiver<Command>,
    transport: Box<dyn TelemetryTransport>,
    pending: Vec<TelemetryRecord>,
    max_batch: usize,
    max_pending: usize,
    flush_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        let mut delivered = 0usize;
        loop {
            match self.receiver.recv_timeout(self.flush_interval) {
                Ok(Command::Record(record)) => {
                    self.pending.push(record);
                    if self.pending.len() >= self.max_batch {
                        delivered += self.deliver_once();
                    }
                }
                Ok(Command::Flush) | Err(RecvTimeoutError::Timeout) => {
                    delivered += self.deliver_once();
                }
                Ok(Command::Close { retry_window, done }) => {
                    let deadline = Instant::now() + retry_window;
                    // Records queued before the close request still count
                    while let Ok(command) = self.receiver.try_recv() {
                        if let Command::Record(record) = command {
                            self.pending.push(record);
                        }
                    }
                    delivered += self.deliver_until(deadline);
                    let abandoned = self.pending.len();
                    if abandoned > 0 {
                        metrics::inc_telemetry_dropped(abandoned as u64);
                    }
                    let _ = done.send(DrainReport {
                        delivered,
                        abandoned,
                    });
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.deliver_once();
                    return;
                }
            }
        }
    }

    /// One pass over the buffer; failed batches stay buffered
    fn deliver_once(&mut self) -> usize {
        let mut delivered = 0;
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.max_batch);
            match self.transport.send(&self.pending[..take]) {
                Ok(()) => {
                    self.pending.drain(..take);
                    delivered += take;
                    metrics::inc_telemetry_delivered(take as u64);
                }
                Err(e) => {
                    metrics::inc_telemetry_send_failure();
                    tracing::debug!(error = %e, buffered = self.pending.len(), "Telemetry delivery failed");
                    self.trim_backlog();
                    break;
                }
            }
        }
        delivered
    }

    /// Retry with backoff until the buffer is empty or the deadline passes
    fn deliver_until(&mut self, deadline: Instant) -> usize {
        let mut delivered = 0;
        let mut backoff = Duration::from_millis(50);
        loop {
            delivered += self.deliver_once();
            if self.pending.is_empty() {
                return delivered;
            }
            let now = Instant::now();
            if now >= deadline {
                return delivered;
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    /// Drop the oldest records once a failing transport lets the buffer grow
    fn trim_backlog(&mut self) {
        if self.pending.len() > self.max_pending {
            let excess = self.pending.len() - self.max_pending;
            self.pending.drain(..excess);
            metrics::inc_telemetry_dropped(excess as u64);
        }
    }
}
