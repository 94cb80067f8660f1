//! Process-level fallback sink

use crate::level::LogLevel;
use crate::logger::{LogSink, Result};
use crate::sanitizer::{Sanitizer, SecretRedactor};

/// [`LogSink`] that forwards into the `tracing` subscriber
///
/// Used as the fallback of every job logger unless the host supplies its own.
/// Events are emitted under the `cirrus::fallback` target, which the job-log
/// bridge ignores.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

pub const FALLBACK_TARGET: &str = "cirrus::fallback";

impl LogSink for TracingSink {
    fn should_log(&self, level: LogLevel) -> bool {
        match level.to_tracing_level() {
            Some(tracing::Level::ERROR) => tracing::enabled!(target: FALLBACK_TARGET, tracing::Level::ERROR),
            Some(tracing::Level::WARN) => tracing::enabled!(target: FALLBACK_TARGET, tracing::Level::WARN),
            Some(tracing::Level::INFO) => tracing::enabled!(target: FALLBACK_TARGET, tracing::Level::INFO),
            Some(_) => tracing::enabled!(target: FALLBACK_TARGET, tracing::Level::DEBUG),
            None => false,
        }
    }

    fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        let message = SecretRedactor.sanitize(message);
        match level.to_tracing_level() {
            Some(tracing::Level::ERROR) => tracing::error!(target: FALLBACK_TARGET, level = level.as_str(), "{}", message),
            Some(tracing::Level::WARN) => tracing::warn!(target: FALLBACK_TARGET, "{}", message),
            Some(tracing::Level::INFO) => tracing::info!(target: FALLBACK_TARGET, "{}", message),
            Some(_) => tracing::debug!(target: FALLBACK_TARGET, "{}", message),
            None => {}
        }
        Ok(())
    }

    fn panic(&self, error: &(dyn std::error::Error + 'static)) -> Result<()> {
        let text = error.to_string();
        tracing::error!(
            target: FALLBACK_TARGET,
            level = LogLevel::Panic.as_str(),
            "{}",
            SecretRedactor.sanitize(&text)
        );
        Ok(())
    }
}
