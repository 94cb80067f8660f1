/*!
 * Cirrus - transfer engine runtime plumbing
 *
 * The pieces every transfer job needs before it moves a byte:
 * - Concurrency sizing derived from CPU count and the open-handle ceiling,
 *   with environment overrides
 * - Per-job log files with level gating, secret redaction and a fallback sink
 * - A shared telemetry pipeline with bounded shutdown
 * - A logging hook for body-read retries
 *
 * Job logging itself lives in the `cirrus-observability` crate; this crate
 * wires it to configuration and process diagnostics.
 */

pub mod config;
pub mod core;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::{EngineConfig, EnvironmentLookup, EnvironmentVariable, ProcessEnvironment};
pub use core::{ConcurrencyResolver, ConcurrencySettings, HandleLimit};
pub use error::{CirrusError, Result};
pub use logging::LoggingContext;

pub use cirrus_observability::{JobId, JobLogger, LogLevel, LogSink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Load configuration and size the engine in one step
///
/// Handle ceiling: environment, then config file, then the OS.
pub fn resolve_concurrency(
    config: &EngineConfig,
    env: &dyn EnvironmentLookup,
) -> Result<(HandleLimit, ConcurrencySettings)> {
    let limit =
        core::resolve_max_file_and_socket_handles(env, config.max_file_and_socket_handles)?;
    let settings = ConcurrencyResolver::new(env).resolve(limit.value)?;
    Ok((limit, settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnvironment;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_resolve_concurrency_from_env() {
        let env = MapEnvironment::new()
            .with(EnvironmentVariable::MAX_FILE_HANDLES, "1000")
            .with(EnvironmentVariable::CONCURRENCY_VALUE, "128");
        let (limit, settings) = resolve_concurrency(&EngineConfig::default(), &env).unwrap();

        assert_eq!(limit.value, 1000);
        assert_eq!(settings.main_pool_size.value, 128);
        assert_eq!(settings.max_open_payload_files, 558);
    }

    #[test]
    fn test_resolve_concurrency_bad_override() {
        let env = MapEnvironment::new().with(EnvironmentVariable::CONCURRENCY_VALUE, "lots");
        let err = resolve_concurrency(&EngineConfig::default(), &env).unwrap_err();
        assert_eq!(err.exit_code(), error::EXIT_FATAL);
    }
}
