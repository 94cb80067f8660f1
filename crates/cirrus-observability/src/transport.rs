//! Delivery back-ends for the telemetry pipeline
//!
//! The pipeline's background worker hands batches of records to a
//! [`TelemetryTransport`]. Transports are synchronous; the worker owns them
//! exclusively, so they only need to be `Send`.

use crate::event::{TelemetryEnvelope, TelemetryRecord};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Header carrying the instrumentation key on ingestion requests
pub const INSTRUMENTATION_KEY_HEADER: &str = "x-cirrus-instrumentation-key";

/// Errors raised while delivering a batch
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ingestion endpoint rejected batch with status {status}")]
    Rejected { status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Something that can ship telemetry batches somewhere
pub trait TelemetryTransport: Send {
    /// Deliver one batch; an `Err` leaves the batch with the caller for retry
    fn send(&mut self, batch: &[TelemetryRecord]) -> Result<(), TransportError>;

    /// Short name for diagnostics
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// POSTs JSON batches to an HTTP ingestion endpoint
///
/// The blocking client is built on first use so that it is created on the
/// pipeline's worker thread rather than on a caller that may be inside an
/// async runtime.
pub struct HttpTransport {
    endpoint: String,
    instrumentation_key: String,
    request_timeout: Duration,
    client: Option<reqwest::blocking::Client>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, instrumentation_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            instrumentation_key: instrumentation_key.into(),
            request_timeout: Duration::from_secs(10),
            client: None,
        }
    }

    /// Per-request timeout (default 10s)
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client, TransportError> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.request_timeout)
                .build()?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::Unavailable("HTTP client not initialised".to_string()))
    }
}

impl TelemetryTransport for HttpTransport {
    fn send(&mut self, batch: &[TelemetryRecord]) -> Result<(), TransportError> {
        let envelope = TelemetryEnvelope {
            sent_at: Utc::now(),
            records: batch,
        };
        let endpoint = self.endpoint.clone();
        let key = self.instrumentation_key.clone();

        let response = self
            .client()?
            .post(endpoint)
            .header(INSTRUMENTATION_KEY_HEADER, key)
            .json(&envelope)
            .send()?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Appends records as JSON Lines to a local spool file
///
/// Each batch is encoded in full before anything touches the file, then
/// appended with a single write.
pub struct JsonLinesTransport {
    file: File,
    path: PathBuf,
}

impl JsonLinesTransport {
    /// Open (or create) the spool file in append mode
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetryTransport for JsonLinesTransport {
    fn send(&mut self, batch: &[TelemetryRecord]) -> Result<(), TransportError> {
        let buf = encode_lines(batch)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-lines"
    }
}

/// One JSON document per record, newline terminated
fn encode_lines(batch: &[TelemetryRecord]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(batch.len() * 256);
    for record in batch {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}
