//! Per-job logger
//!
//! A [`JobLogger`] writes one job's log file (`<folder>/<job-id>.log`),
//! forwards gated lines to the telemetry pipeline and routes unrecoverable
//! errors to a fallback [`LogSink`] as well, so a panic is recorded in at least
//! two independent places.
//!
//! ## Lifecycle
//!
//! `Constructed → Opened → Closed`, tracked by an internal state machine:
//!
//! - logging before [`open`](JobLogger::open) returns [`LoggerError::NotOpened`]
//! - logging after [`close`](JobLogger::close) returns [`LoggerError::Closed`]
//! - opening twice returns [`LoggerError::InvalidState`]
//!
//! All methods take `&self`; the file is guarded by a mutex so every line is
//! appended whole, whatever the number of concurrent callers.
//!
//! ## Example
//!
//! ```no_run
//! use cirrus_observability::{JobId, JobLogger, LogLevel, LogSink, TracingSink};
//! use std::sync::Arc;
//!
//! let logger = JobLogger::new(JobId::new(), LogLevel::Info, "/var/log/cirrus", Arc::new(TracingSink));
//! logger.open().unwrap();
//! logger.log(LogLevel::Info, "transfer started").unwrap();
//! logger.close().unwrap();
//! ```

use crate::job::JobId;
use crate::level::LogLevel;
use crate::metrics;
use crate::sanitizer::{Sanitizer, SecretRedactor};
use crate::telemetry::{ShutdownOutcome, TelemetryLease, TelemetryPipeline};
use chrono::Utc;
use std::borrow::Cow;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Engine version written to the top of every job log
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Last line written to a job log
pub const CLOSING_MARKER: &str = "Closing Log";

/// Line terminator of the host platform
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

/// UTC timestamp prefix, e.g. `2024/03/09 17:04:05`
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[cfg(unix)]
const LOG_FILE_MODE: u32 = 0o644;

/// Errors that can occur during job logging
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("job log has not been opened")]
    NotOpened,

    #[error("job log is already closed")]
    Closed,

    #[error("cannot {operation} a job log that is {state}")]
    InvalidState {
        operation: &'static str,
        state: LoggerState,
    },

    #[error("failed to open job log {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to close job log {}: {source}", path.display())]
    Close {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl LoggerError {
    /// Open and close failures mean the job's audit trail cannot be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoggerError::Open { .. } | LoggerError::Close { .. })
    }
}

/// Result type for logger operations
pub type Result<T> = std::result::Result<T, LoggerError>;

/// Narrow logging capability handed to other subsystems
///
/// Retry callbacks, the tracing bridge and fallback chains only need these
/// three operations; lifecycle control stays on [`JobLogger`].
pub trait LogSink: Send + Sync {
    /// Whether a message at `level` would be emitted
    fn should_log(&self, level: LogLevel) -> bool;

    /// Emit a message if it passes the gate
    fn log(&self, level: LogLevel, message: &str) -> Result<()>;

    /// Record an unrecoverable error; never terminates the process
    fn panic(&self, error: &(dyn std::error::Error + 'static)) -> Result<()>;
}

/// Observable lifecycle state of a [`JobLogger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Constructed,
    Opened,
    Closed,
}

impl fmt::Display for LoggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerState::Constructed => write!(f, "not yet opened"),
            LoggerState::Opened => write!(f, "open"),
            LoggerState::Closed => write!(f, "closed"),
        }
    }
}

enum FileState {
    Constructed,
    /// `None` when the minimum level is `None` and no file was created
    Opened(Option<BufWriter<File>>),
    Closed,
}

impl FileState {
    fn public(&self) -> LoggerState {
        match self {
            FileState::Constructed => LoggerState::Constructed,
            FileState::Opened(_) => LoggerState::Opened,
            FileState::Closed => LoggerState::Closed,
        }
    }
}

struct LoggerInner {
    file: FileState,
    telemetry: Option<TelemetryLease>,
}

/// Structured logger scoped to one transfer job
pub struct JobLogger {
    job_id: JobId,
    session_id: String,
    minimum: LogLevel,
    path: PathBuf,
    fallback: Arc<dyn LogSink>,
    sanitizer: Arc<dyn Sanitizer>,
    inner: Mutex<LoggerInner>,
}

impl JobLogger {
    /// Create a logger for `job_id` writing into `log_folder`
    ///
    /// Nothing touches the filesystem until [`open`](Self::open).
    pub fn new(
        job_id: JobId,
        minimum: LogLevel,
        log_folder: impl AsRef<Path>,
        fallback: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            job_id,
            session_id: job_id.to_string(),
            minimum,
            path: log_folder.as_ref().join(job_id.log_file_name()),
            fallback,
            sanitizer: Arc::new(SecretRedactor),
            inner: Mutex::new(LoggerInner {
                file: FileState::Constructed,
                telemetry: None,
            }),
        }
    }

    /// Attach the shared telemetry pipeline
    ///
    /// Takes a lease on the pipeline and binds its session to this job. A
    /// pipeline that is already closing grants no lease, and the logger then
    /// writes to its file only.
    pub fn with_telemetry(self, pipeline: &Arc<TelemetryPipeline>) -> Self {
        match pipeline.acquire() {
            Some(lease) => {
                pipeline.bind_session(&self.session_id);
                self.lock().telemetry = Some(lease);
            }
            None => {
                tracing::debug!(job_id = %self.job_id, "Telemetry closed; logging to file only");
            }
        }
        self
    }

    /// Replace the default [`SecretRedactor`]
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Path of the job's log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn minimum_level(&self) -> LogLevel {
        self.minimum
    }

    pub fn state(&self) -> LoggerState {
        self.lock().file.public()
    }

    pub fn has_telemetry(&self) -> bool {
        self.lock().telemetry.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, LoggerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the log file in append mode and write the bootstrap lines
    ///
    /// A logger whose minimum level is `None` moves to the opened state
    /// without creating anything on disk.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.lock();
        let state = inner.file.public();
        if state != LoggerState::Constructed {
            return Err(LoggerError::InvalidState {
                operation: "open",
                state,
            });
        }

        if self.minimum == LogLevel::None {
            inner.file = FileState::Opened(None);
            return Ok(());
        }

        let mut writer = open_append(&self.path).map_err(|source| LoggerError::Open {
            path: self.path.clone(),
            source,
        })?;

        let bootstrap = [
            format!("CirrusVersion {ENGINE_VERSION}"),
            format!("OS-Environment {}", std::env::consts::OS),
            format!("OS-Architecture {}", std::env::consts::ARCH),
        ];
        for line in &bootstrap {
            write_line(&mut writer, line).map_err(|source| LoggerError::Open {
                path: self.path.clone(),
                source,
            })?;
            metrics::inc_log_line(LogLevel::Info.as_str());
            if self.should_log(LogLevel::Info) {
                self.record_telemetry(&inner, LogLevel::Info, line);
            }
        }

        inner.file = FileState::Opened(Some(writer));
        tracing::debug!(job_id = %self.job_id, path = %self.path.display(), "Job log opened");
        Ok(())
    }

    /// Write `Closing Log`, close the file and release the telemetry lease
    ///
    /// Releasing the last lease flushes and closes the pipeline, bounded by
    /// its hard timeout. A file error is reported only after that shutdown
    /// has been attempted. Closing a logger that was never opened releases
    /// telemetry without touching the filesystem.
    pub fn close(&self) -> Result<Option<ShutdownOutcome>> {
        let (file_result, lease) = {
            let mut inner = self.lock();
            let file_result = match std::mem::replace(&mut inner.file, FileState::Closed) {
                FileState::Closed => return Err(LoggerError::Closed),
                FileState::Constructed | FileState::Opened(None) => Ok(()),
                FileState::Opened(Some(writer)) => {
                    finish_file(writer).map_err(|source| LoggerError::Close {
                        path: self.path.clone(),
                        source,
                    })
                }
            };
            (file_result, inner.telemetry.take())
        };

        // The pipeline shutdown can block; never hold the file lock across it
        let outcome = lease.and_then(TelemetryLease::release);
        file_result.map(|()| outcome)
    }

    fn prepare<'a>(&self, message: &'a str) -> Cow<'a, str> {
        let sanitized = self.sanitizer.sanitize(message);
        if LINE_ENDING != "\n" && sanitized.contains('\n') {
            Cow::Owned(sanitized.replace('\n', LINE_ENDING))
        } else {
            sanitized
        }
    }

    fn record_telemetry(&self, inner: &LoggerInner, level: LogLevel, message: &str) {
        if let Some(ref lease) = inner.telemetry {
            lease
                .pipeline()
                .record_event_for(&self.session_id, level, message);
        }
    }
}

impl LogSink for JobLogger {
    fn should_log(&self, level: LogLevel) -> bool {
        level.passes(self.minimum)
    }

    /// Sanitize, gate, then append one timestamped line and forward it to
    /// telemetry. A message that fails the gate has no side effects.
    fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        if !self.should_log(level) {
            return Ok(());
        }
        let message = self.prepare(message);

        let mut inner = self.lock();
        match inner.file {
            FileState::Constructed => return Err(LoggerError::NotOpened),
            FileState::Closed => return Err(LoggerError::Closed),
            FileState::Opened(Some(ref mut writer)) => {
                write_line(writer, &message)?;
                metrics::inc_log_line(level.as_str());
            }
            FileState::Opened(None) => {}
        }
        self.record_telemetry(&inner, level, &message);
        Ok(())
    }

    /// Record `error` in the file regardless of the gate, in telemetry at
    /// panic level and in the fallback sink
    fn panic(&self, error: &(dyn std::error::Error + 'static)) -> Result<()> {
        let text = error.to_string();
        let message = self.prepare(&text);

        let file_result = {
            let mut inner = self.lock();
            let result = match inner.file {
                FileState::Constructed => Err(LoggerError::NotOpened),
                FileState::Closed => Err(LoggerError::Closed),
                FileState::Opened(Some(ref mut writer)) => {
                    let written = write_line(writer, &message).map_err(LoggerError::from);
                    if written.is_ok() {
                        metrics::inc_log_line(LogLevel::Panic.as_str());
                    }
                    written
                }
                FileState::Opened(None) => Ok(()),
            };
            self.record_telemetry(&inner, LogLevel::Panic, &message);
            result
        };

        let fallback_result = self.fallback.panic(error);
        file_result.and(fallback_result)
    }
}

impl fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLogger")
            .field("job_id", &self.job_id)
            .field("minimum", &self.minimum)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(LOG_FILE_MODE);
    }

    Ok(BufWriter::new(options.open(path)?))
}

fn write_line(writer: &mut BufWriter<File>, message: &str) -> io::Result<()> {
    write!(
        writer,
        "{} {}{}",
        Utc::now().format(TIMESTAMP_FORMAT),
        message,
        LINE_ENDING
    )?;
    writer.flush()
}

fn finish_file(mut writer: BufWriter<File>) -> io::Result<()> {
    write_line(&mut writer, CLOSING_MARKER)?;
    metrics::inc_log_line(LogLevel::Info.as_str());
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}
