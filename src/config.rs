/*!
 * Configuration for Cirrus
 *
 * Two layers feed the engine:
 *
 * - `EngineConfig`, loaded from a TOML file (or defaults), for logging and
 *   telemetry settings
 * - environment variables, which override individual tunables and are read
 *   through the `EnvironmentLookup` trait so tests can supply a map instead
 *   of the process environment
 */

use crate::error::{CirrusError, Result};
use cirrus_observability::{InstrumentationKey, LogLevel, TelemetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// An environment variable the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvironmentVariable {
    pub name: &'static str,
    pub description: &'static str,
}

impl EnvironmentVariable {
    /// Size of the main pool that moves payload data
    pub const CONCURRENCY_VALUE: EnvironmentVariable = EnvironmentVariable {
        name: "CIRRUS_CONCURRENCY_VALUE",
        description: "Overrides how many operations run concurrently in the main transfer pool",
    };

    /// Size of the pool that initiates transfers
    pub const TRANSFER_INITIATION_POOL_SIZE: EnvironmentVariable = EnvironmentVariable {
        name: "CIRRUS_TRANSFER_INITIATION_POOL_SIZE",
        description: "Overrides the size of the pool that initiates transfers",
    };

    pub const TELEMETRY_KEY: EnvironmentVariable = EnvironmentVariable {
        name: cirrus_observability::telemetry::INSTRUMENTATION_KEY_ENV,
        description: "Instrumentation key for telemetry; telemetry stays off without it",
    };

    pub const TELEMETRY_ENDPOINT: EnvironmentVariable = EnvironmentVariable {
        name: cirrus_observability::telemetry::ENDPOINT_ENV,
        description: "Ingestion endpoint for telemetry batches",
    };

    pub const LOG_LOCATION: EnvironmentVariable = EnvironmentVariable {
        name: "CIRRUS_LOG_LOCATION",
        description: "Folder that receives per-job log files",
    };

    pub const LOG_LEVEL: EnvironmentVariable = EnvironmentVariable {
        name: "CIRRUS_LOG_LEVEL",
        description: "Minimum level written to job logs (none, fatal, panic, error, warning, info, debug)",
    };

    pub const MAX_FILE_HANDLES: EnvironmentVariable = EnvironmentVariable {
        name: "CIRRUS_MAX_FILE_HANDLES",
        description: "Overrides the detected ceiling on open files and sockets",
    };

    /// Every variable, in display order
    pub const ALL: [EnvironmentVariable; 7] = [
        Self::CONCURRENCY_VALUE,
        Self::TRANSFER_INITIATION_POOL_SIZE,
        Self::MAX_FILE_HANDLES,
        Self::LOG_LOCATION,
        Self::LOG_LEVEL,
        Self::TELEMETRY_KEY,
        Self::TELEMETRY_ENDPOINT,
    ];
}

impl fmt::Display for EnvironmentVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Source of environment values
pub trait EnvironmentLookup {
    /// Raw value of `var`, `None` when unset
    fn get(&self, var: &EnvironmentVariable) -> Option<String>;
}

/// Reads the real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl EnvironmentLookup for ProcessEnvironment {
    fn get(&self, var: &EnvironmentVariable) -> Option<String> {
        std::env::var(var.name).ok()
    }
}

/// Fixed set of values, keyed by variable name
#[derive(Debug, Clone, Default)]
pub struct MapEnvironment {
    values: HashMap<String, String>,
}

impl MapEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, var: EnvironmentVariable, value: impl Into<String>) -> Self {
        self.values.insert(var.name.to_string(), value.into());
        self
    }
}

impl EnvironmentLookup for MapEnvironment {
    fn get(&self, var: &EnvironmentVariable) -> Option<String> {
        self.values.get(var.name).cloned()
    }
}

/// An integer tunable together with where its value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredValue {
    pub value: usize,
    pub is_user_specified: bool,
    pub env_var_name: &'static str,
    /// Empty when the value came from the environment
    pub default_source: &'static str,
}

impl ConfiguredValue {
    /// Value computed by the engine
    pub fn computed(value: usize, var: EnvironmentVariable, default_source: &'static str) -> Self {
        Self {
            value,
            is_user_specified: false,
            env_var_name: var.name,
            default_source,
        }
    }

    /// Value taken from an environment override
    pub fn user_specified(value: usize, var: EnvironmentVariable) -> Self {
        Self {
            value,
            is_user_specified: true,
            env_var_name: var.name,
            default_source: "",
        }
    }

    /// Human-readable provenance, e.g. for `cirrus settings`
    pub fn description(&self) -> String {
        if self.is_user_specified {
            format!("From {} environment variable", self.env_var_name)
        } else {
            format!(
                "From {}. Set {} environment variable to override",
                self.default_source, self.env_var_name
            )
        }
    }
}

impl fmt::Display for ConfiguredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.description())
    }
}

/// Read an integer override for `var`
///
/// `Ok(None)` when the variable is unset or empty. A value that does not
/// parse as a non-negative base-10 integer is a fatal configuration error.
pub fn try_configured_value(
    env: &dyn EnvironmentLookup,
    var: EnvironmentVariable,
) -> Result<Option<ConfiguredValue>> {
    match env.get(&var) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<usize>()
            .map(|value| Some(ConfiguredValue::user_specified(value, var)))
            .map_err(|e| CirrusError::InvalidOverride {
                key: var.name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum level written to job logs
    #[serde(default)]
    pub log_level: LogLevel,

    /// Folder for `<job-id>.log` files
    #[serde(default = "default_log_folder")]
    pub log_folder: PathBuf,

    /// Ceiling on open files and sockets (None = detect from the OS)
    #[serde(default)]
    pub max_file_and_socket_handles: Option<usize>,

    /// Process diagnostics written as JSON to this file (None = stderr)
    #[serde(default)]
    pub diagnostics_file: Option<PathBuf>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_log_folder() -> PathBuf {
    std::env::temp_dir().join("cirrus").join("logs")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_folder: default_log_folder(),
            max_file_and_socket_handles: None,
            diagnostics_file: None,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CirrusError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Overlay environment variables on top of the file values
    pub fn apply_env(mut self, env: &dyn EnvironmentLookup) -> Result<Self> {
        if let Some(folder) = env.get(&EnvironmentVariable::LOG_LOCATION) {
            if !folder.is_empty() {
                self.log_folder = PathBuf::from(folder);
            }
        }

        if let Some(level) = env.get(&EnvironmentVariable::LOG_LEVEL) {
            if !level.is_empty() {
                self.log_level = level.parse().map_err(|e: cirrus_observability::ParseLevelError| {
                    CirrusError::InvalidOverride {
                        key: EnvironmentVariable::LOG_LEVEL.name.to_string(),
                        value: level.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }

        if let Some(handles) = try_configured_value(env, EnvironmentVariable::MAX_FILE_HANDLES)? {
            self.max_file_and_socket_handles = Some(handles.value);
        }

        if let Some(key) = env.get(&EnvironmentVariable::TELEMETRY_KEY) {
            self.telemetry.instrumentation_key = InstrumentationKey::new(key);
        }

        if let Some(endpoint) = env.get(&EnvironmentVariable::TELEMETRY_ENDPOINT) {
            if !endpoint.is_empty() {
                self.telemetry.endpoint = Some(endpoint);
            }
        }

        Ok(self)
    }

    /// Load from an optional file, then apply the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        base.apply_env(&ProcessEnvironment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_description_user_specified() {
        let v = ConfiguredValue::user_specified(500, EnvironmentVariable::CONCURRENCY_VALUE);
        assert_eq!(
            v.description(),
            "From CIRRUS_CONCURRENCY_VALUE environment variable"
        );
    }

    #[test]
    fn test_description_computed() {
        let v = ConfiguredValue::computed(
            64,
            EnvironmentVariable::TRANSFER_INITIATION_POOL_SIZE,
            "hard-coded default",
        );
        assert_eq!(
            v.description(),
            "From hard-coded default. Set CIRRUS_TRANSFER_INITIATION_POOL_SIZE environment variable to override"
        );
        assert!(!v.is_user_specified);
    }

    #[test]
    fn test_try_configured_value_absent_and_empty() {
        let env = MapEnvironment::new();
        assert!(try_configured_value(&env, EnvironmentVariable::CONCURRENCY_VALUE)
            .unwrap()
            .is_none());

        let env = MapEnvironment::new().with(EnvironmentVariable::CONCURRENCY_VALUE, "");
        assert!(try_configured_value(&env, EnvironmentVariable::CONCURRENCY_VALUE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_try_configured_value_parses() {
        let env = MapEnvironment::new().with(EnvironmentVariable::CONCURRENCY_VALUE, "17");
        let v = try_configured_value(&env, EnvironmentVariable::CONCURRENCY_VALUE)
            .unwrap()
            .unwrap();
        assert_eq!(v.value, 17);
        assert!(v.is_user_specified);
        assert_eq!(v.default_source, "");
    }

    #[test]
    fn test_try_configured_value_rejects_garbage() {
        for bad in ["abc", "12x", " 12", "-4", "1.5"] {
            let env = MapEnvironment::new().with(EnvironmentVariable::CONCURRENCY_VALUE, bad);
            match try_configured_value(&env, EnvironmentVariable::CONCURRENCY_VALUE) {
                Err(CirrusError::InvalidOverride { key, value, .. }) => {
                    assert_eq!(key, "CIRRUS_CONCURRENCY_VALUE");
                    assert_eq!(value, bad);
                }
                other => panic!("expected InvalidOverride for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.max_file_and_socket_handles.is_none());
        assert!(!config.telemetry.enabled);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cirrus.toml");

        let mut config = EngineConfig {
            log_level: LogLevel::Debug,
            log_folder: dir.path().join("logs"),
            max_file_and_socket_handles: Some(4096),
            ..Default::default()
        };
        config.telemetry.enabled = true;
        config.telemetry.instrumentation_key = InstrumentationKey::new("never-persisted");
        config.save_to_file(&path).unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(!saved.contains("never-persisted"));

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.log_level, LogLevel::Debug);
        assert_eq!(loaded.max_file_and_socket_handles, Some(4096));
        assert!(loaded.telemetry.enabled);
        assert!(loaded.telemetry.instrumentation_key.is_none());
    }

    #[test]
    fn test_config_example_parses() {
        let toml_str = r#"
log_level = "WARNING"
log_folder = "/var/log/cirrus"

[telemetry]
enabled = true
endpoint = "https://ingest.example.net/v1/batch"
soft_timeout_secs = 5
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, LogLevel::Warning);
        assert_eq!(config.log_folder, PathBuf::from("/var/log/cirrus"));
        assert_eq!(config.telemetry.soft_timeout_secs, 5);
        assert_eq!(config.telemetry.hard_timeout_secs, 30);
    }

    #[test]
    fn test_apply_env_overrides() {
        let env = MapEnvironment::new()
            .with(EnvironmentVariable::LOG_LOCATION, "/tmp/cirrus-jobs")
            .with(EnvironmentVariable::LOG_LEVEL, "error")
            .with(EnvironmentVariable::MAX_FILE_HANDLES, "2048")
            .with(EnvironmentVariable::TELEMETRY_KEY, "abc")
            .with(EnvironmentVariable::TELEMETRY_ENDPOINT, "https://ingest.example.net");

        let config = EngineConfig::default().apply_env(&env).unwrap();
        assert_eq!(config.log_folder, PathBuf::from("/tmp/cirrus-jobs"));
        assert_eq!(config.log_level, LogLevel::Error);
        assert_eq!(config.max_file_and_socket_handles, Some(2048));
        assert!(config.telemetry.instrumentation_key.is_some());
        assert_eq!(
            config.telemetry.endpoint.as_deref(),
            Some("https://ingest.example.net")
        );
    }

    #[test]
    fn test_apply_env_bad_level_is_fatal() {
        let env = MapEnvironment::new().with(EnvironmentVariable::LOG_LEVEL, "loud");
        let err = EngineConfig::default().apply_env(&env).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("CIRRUS_LOG_LEVEL"));
    }
}
