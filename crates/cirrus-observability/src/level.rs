//! Severity scale shared by job logs and telemetry
//!
//! Levels are ordered by verbosity: `None` sits below everything and means
//! "never log", `Fatal` is the most severe real level and `Debug` the most
//! verbose. A message passes a logger's gate when it is not `None` and is at
//! most as verbose as the logger's minimum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Log severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum LogLevel {
    /// Never log
    None = 0,
    Fatal = 1,
    Panic = 2,
    Error = 3,
    Warning = 4,
    #[default]
    Info = 5,
    Debug = 6,
}

impl LogLevel {
    /// All levels that can actually be emitted, most severe first
    pub const EMITTABLE: [LogLevel; 6] = [
        LogLevel::Fatal,
        LogLevel::Panic,
        LogLevel::Error,
        LogLevel::Warning,
        LogLevel::Info,
        LogLevel::Debug,
    ];

    /// Whether a message at `self` passes a gate configured with `minimum`
    pub fn passes(self, minimum: LogLevel) -> bool {
        self != LogLevel::None && self <= minimum
    }

    /// Upper-case tag used in telemetry records
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Fatal => "FATAL",
            LogLevel::Panic => "PANIC",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Whether telemetry records this level as an exception rather than an event
    pub fn is_exception(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Panic)
    }

    /// Closest tracing level, `None` for the silent level
    pub fn to_tracing_level(&self) -> Option<tracing::Level> {
        match self {
            LogLevel::None => None,
            LogLevel::Fatal | LogLevel::Panic | LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::Warning => Some(tracing::Level::WARN),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG | tracing::Level::TRACE => LogLevel::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}' (expected none, fatal, panic, error, warning, info or debug)")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LogLevel::None),
            "fatal" => Ok(LogLevel::Fatal),
            "panic" => Ok(LogLevel::Panic),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" | "trace" => Ok(LogLevel::Debug),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_passes() {
        for minimum in LogLevel::EMITTABLE.iter().copied().chain([LogLevel::None]) {
            assert!(!LogLevel::None.passes(minimum), "minimum {minimum}");
        }
    }

    #[test]
    fn test_silent_minimum_blocks_everything() {
        for level in LogLevel::EMITTABLE {
            assert!(!level.passes(LogLevel::None));
        }
    }

    #[test]
    fn test_gate_ordering() {
        assert!(LogLevel::Error.passes(LogLevel::Warning));
        assert!(LogLevel::Warning.passes(LogLevel::Warning));
        assert!(!LogLevel::Info.passes(LogLevel::Warning));
        assert!(!LogLevel::Debug.passes(LogLevel::Info));
        assert!(LogLevel::Fatal.passes(LogLevel::Fatal));
        assert!(!LogLevel::Panic.passes(LogLevel::Fatal));
    }

    #[test]
    fn test_exception_classification() {
        assert!(LogLevel::Error.is_exception());
        assert!(LogLevel::Panic.is_exception());
        assert!(!LogLevel::Fatal.is_exception());
        assert!(!LogLevel::Warning.is_exception());
        assert!(!LogLevel::Info.is_exception());
    }

    #[test]
    fn test_parse() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("none".parse::<LogLevel>().unwrap(), LogLevel::None);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_serde_uses_upper_case_tags() {
        let json = serde_json::to_string(&LogLevel::Warning).unwrap();
        assert_eq!(json, "\"WARNING\"");
        let level: LogLevel = serde_json::from_str("\"PANIC\"").unwrap();
        assert_eq!(level, LogLevel::Panic);
    }

    #[test]
    fn test_tracing_conversion() {
        assert_eq!(LogLevel::from(tracing::Level::TRACE), LogLevel::Debug);
        assert_eq!(LogLevel::from(tracing::Level::WARN), LogLevel::Warning);
        assert_eq!(LogLevel::Panic.to_tracing_level(), Some(tracing::Level::ERROR));
        assert_eq!(LogLevel::None.to_tracing_level(), None);
    }
}
