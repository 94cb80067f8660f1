/*!
 * Error types for Cirrus
 */

use cirrus_observability::{LoggerError, TelemetryError};
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, CirrusError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug)]
pub enum CirrusError {
    /// An environment override could not be parsed
    InvalidOverride {
        key: String,
        value: String,
        reason: String,
    },

    /// Configuration file could not be read or parsed
    Config(String),

    /// Job log could not be opened, written or closed
    JobLog(LoggerError),

    /// Telemetry pipeline could not be started
    Telemetry(TelemetryError),

    /// I/O error
    Io(io::Error),

    /// Generic error with message
    Other(String),
}

impl CirrusError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_FATAL
        } else {
            EXIT_PARTIAL
        }
    }

    /// Whether the process must stop rather than continue degraded
    pub fn is_fatal(&self) -> bool {
        match self {
            CirrusError::InvalidOverride { .. } => true,
            CirrusError::Config(_) => true,
            CirrusError::JobLog(err) => err.is_fatal(),

            // Telemetry is best-effort
            CirrusError::Telemetry(_) => false,
            CirrusError::Io(_) => false,
            CirrusError::Other(_) => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            CirrusError::InvalidOverride { .. } | CirrusError::Config(_) => {
                ErrorCategory::Configuration
            }
            CirrusError::JobLog(_) => ErrorCategory::Logging,
            CirrusError::Telemetry(_) => ErrorCategory::Telemetry,
            CirrusError::Io(_) => ErrorCategory::IoError,
            CirrusError::Other(_) => ErrorCategory::Unknown,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed overrides or config files
    Configuration,
    /// Job log lifecycle errors
    Logging,
    /// Telemetry startup errors
    Telemetry,
    /// I/O operation errors
    IoError,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Logging => write!(f, "logging"),
            ErrorCategory::Telemetry => write!(f, "telemetry"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for CirrusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CirrusError::InvalidOverride { key, value, reason } => {
                write!(
                    f,
                    "Invalid value '{}' for environment variable {}: {}",
                    value, key, reason
                )
            }
            CirrusError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            CirrusError::JobLog(err) => {
                write!(f, "Job log error: {}", err)
            }
            CirrusError::Telemetry(err) => {
                write!(f, "Telemetry error: {}", err)
            }
            CirrusError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            CirrusError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for CirrusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CirrusError::JobLog(err) => Some(err),
            CirrusError::Telemetry(err) => Some(err),
            CirrusError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CirrusError {
    fn from(err: io::Error) -> Self {
        CirrusError::Io(err)
    }
}

impl From<LoggerError> for CirrusError {
    fn from(err: LoggerError) -> Self {
        CirrusError::JobLog(err)
    }
}

impl From<TelemetryError> for CirrusError {
    fn from(err: TelemetryError) -> Self {
        CirrusError::Telemetry(err)
    }
}

impl From<toml::de::Error> for CirrusError {
    fn from(err: toml::de::Error) -> Self {
        CirrusError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for CirrusError {
    fn from(err: toml::ser::Error) -> Self {
        CirrusError::Config(format!("TOML serialization error: {}", err))
    }
}
