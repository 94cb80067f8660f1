/*!
 * Concurrency sizing for the transfer engine
 *
 * Resolves how large the engine's worker pools should be and how many
 * payload files may be open at once, from machine facts and environment
 * overrides.
 */

use std::fmt;

use crate::config::{try_configured_value, ConfiguredValue, EnvironmentLookup, EnvironmentVariable};
use crate::error::Result;

/// Main pool size on machines with four CPUs or fewer
pub const SMALL_MACHINE_POOL_SIZE: usize = 32;

/// Ceiling on the computed main pool size
pub const MAX_COMPUTED_POOL_SIZE: usize = 300;

/// Main pool slots per CPU between the floor and the ceiling
pub const POOL_SIZE_PER_CPU: usize = 16;

pub const DEFAULT_TRANSFER_INITIATION_POOL_SIZE: usize = 64;

/// Lowest payload-file limit ever returned
pub const CONCURRENT_FILES_FLOOR: usize = 32;

/// Handles reserved for job plan files
pub const PLAN_FILE_HANDLE_ALLOWANCE: usize = 300;

/// Handles reserved for listing that may still run during transfer
pub const ENUMERATION_HANDLE_ALLOWANCE: usize = 1;

/// Safety margin applied to the connection count
pub const CONNECTION_HANDLE_FACTOR: f64 = 1.1;

/// Resolved pool sizes and handle budgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// Pool that moves payload data
    pub main_pool_size: ConfiguredValue,

    /// Pool that initiates transfers
    pub transfer_initiation_pool_size: ConfiguredValue,

    /// Idle connections kept warm; a snapshot of the main pool size
    pub max_idle_connections: usize,

    /// Payload files that may be open at once
    pub max_open_payload_files: usize,
}

impl fmt::Display for ConcurrencySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Main pool size:                {}", self.main_pool_size)?;
        writeln!(
            f,
            "Transfer initiation pool size: {}",
            self.transfer_initiation_pool_size
        )?;
        writeln!(f, "Max idle connections:          {}", self.max_idle_connections)?;
        write!(f, "Max open payload files:        {}", self.max_open_payload_files)
    }
}

/// Computes `ConcurrencySettings` once at startup
///
/// The CPU count is injected so sizing can be checked for any machine shape.
pub struct ConcurrencyResolver<'a> {
    env: &'a dyn EnvironmentLookup,
    cpu_count: usize,
}

impl<'a> ConcurrencyResolver<'a> {
    /// Resolver for this machine
    pub fn new(env: &'a dyn EnvironmentLookup) -> Self {
        Self::with_cpu_count(env, num_cpus::get())
    }

    pub fn with_cpu_count(env: &'a dyn EnvironmentLookup, cpu_count: usize) -> Self {
        Self { env, cpu_count }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// Resolve every setting
    ///
    /// Fails only when an override is malformed, which callers must treat as
    /// fatal.
    pub fn resolve(&self, max_file_and_socket_handles: usize) -> Result<ConcurrencySettings> {
        let main_pool_size = self.main_pool_size()?;
        let transfer_initiation_pool_size = self.transfer_initiation_pool_size()?;

        // The pool may one day grow dynamically; size handles for its cap
        let max_main_pool_size = main_pool_size.value;

        let settings = ConcurrencySettings {
            max_idle_connections: max_main_pool_size,
            max_open_payload_files: max_open_payload_files(
                max_file_and_socket_handles,
                max_main_pool_size,
            ),
            main_pool_size,
            transfer_initiation_pool_size,
        };

        tracing::debug!(
            cpus = self.cpu_count,
            main_pool = settings.main_pool_size.value,
            initiation_pool = settings.transfer_initiation_pool_size.value,
            payload_files = settings.max_open_payload_files,
            "Resolved concurrency settings"
        );
        Ok(settings)
    }

    fn main_pool_size(&self) -> Result<ConfiguredValue> {
        let var = EnvironmentVariable::CONCURRENCY_VALUE;
        if let Some(value) = try_configured_value(self.env, var)? {
            return Ok(value);
        }
        Ok(ConfiguredValue::computed(
            main_pool_size_for_cpus(self.cpu_count),
            var,
            "number of CPUs",
        ))
    }

    fn transfer_initiation_pool_size(&self) -> Result<ConfiguredValue> {
        let var = EnvironmentVariable::TRANSFER_INITIATION_POOL_SIZE;
        if let Some(value) = try_configured_value(self.env, var)? {
            return Ok(value);
        }
        Ok(ConfiguredValue::computed(
            DEFAULT_TRANSFER_INITIATION_POOL_SIZE,
            var,
            "hard-coded default",
        ))
    }
}

/// Default main pool size for a machine with `cpu_count` CPUs
pub fn main_pool_size_for_cpus(cpu_count: usize) -> usize {
    if cpu_count <= 4 {
        SMALL_MACHINE_POOL_SIZE
    } else if POOL_SIZE_PER_CPU * cpu_count > MAX_COMPUTED_POOL_SIZE {
        MAX_COMPUTED_POOL_SIZE
    } else {
        POOL_SIZE_PER_CPU * cpu_count
    }
}

/// Payload files that fit in the handle ceiling after connections and
/// reserved allowances, never below `CONCURRENT_FILES_FLOOR`
pub fn max_open_payload_files(max_file_and_socket_handles: usize, concurrent_connections: usize) -> usize {
    let known_handles = concurrent_connections as f64 * CONNECTION_HANDLE_FACTOR
        + PLAN_FILE_HANDLE_ALLOWANCE as f64
        + ENUMERATION_HANDLE_ALLOWANCE as f64;

    let remaining = (max_file_and_socket_handles as f64 - known_handles).floor();
    if remaining < CONCURRENT_FILES_FLOOR as f64 {
        CONCURRENT_FILES_FLOOR
    } else {
        remaining as usize
    }
}

// CPU detection falls back to a single CPU, which sizes the main pool at
// its small-machine floor
mod num_cpus {
    use std::thread;

    pub fn get() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|e| {
                tracing::warn!(
                    error = %e,
                    "Failed to detect available parallelism; assuming 1 CPU"
                );
                1
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnvironment;
    use crate::error::CirrusError;

    #[test]
    fn test_small_machines_get_floor() {
        for cpus in 0..=4 {
            assert_eq!(main_pool_size_for_cpus(cpus), 32, "cpus={cpus}");
        }
    }

    #[test]
    fn test_large_machines_are_clamped() {
        for cpus in [19, 20, 64, 256] {
            assert_eq!(main_pool_size_for_cpus(cpus), 300, "cpus={cpus}");
        }
    }

    #[test]
    fn test_mid_range_scales_with_cpus() {
        for cpus in 5..=18 {
            assert_eq!(main_pool_size_for_cpus(cpus), 16 * cpus, "cpus={cpus}");
        }
    }

    #[test]
    fn test_payload_files_scenario() {
        // 1000 - (128 * 1.1 + 300 + 1) = 558.2
        assert_eq!(max_open_payload_files(1000, 128), 558);
    }

    #[test]
    fn test_payload_files_floor() {
        assert_eq!(max_open_payload_files(0, 300), CONCURRENT_FILES_FLOOR);
        assert_eq!(max_open_payload_files(400, 32), CONCURRENT_FILES_FLOOR);
        assert_eq!(max_open_payload_files(100_000, 300), 100_000 - 631);
        for handles in (0..2000).step_by(37) {
            for conns in [0, 32, 128, 300, 5000] {
                assert!(max_open_payload_files(handles, conns) >= CONCURRENT_FILES_FLOOR);
            }
        }
    }

    #[test]
    fn test_resolver_defaults() {
        let env = MapEnvironment::new();
        let settings = ConcurrencyResolver::with_cpu_count(&env, 8)
            .resolve(1000)
            .unwrap();

        assert_eq!(settings.main_pool_size.value, 128);
        assert!(!settings.main_pool_size.is_user_specified);
        assert_eq!(
            settings.main_pool_size.description(),
            "From number of CPUs. Set CIRRUS_CONCURRENCY_VALUE environment variable to override"
        );
        assert_eq!(settings.transfer_initiation_pool_size.value, 64);
        assert_eq!(settings.max_idle_connections, 128);
        assert_eq!(settings.max_open_payload_files, 558);
    }

    #[test]
    fn test_resolver_overrides() {
        let env = MapEnvironment::new()
            .with(EnvironmentVariable::CONCURRENCY_VALUE, "500")
            .with(EnvironmentVariable::TRANSFER_INITIATION_POOL_SIZE, "8");
        let settings = ConcurrencyResolver::with_cpu_count(&env, 2)
            .resolve(10_000)
            .unwrap();

        assert_eq!(settings.main_pool_size.value, 500);
        assert!(settings.main_pool_size.is_user_specified);
        assert_eq!(settings.max_idle_connections, 500);
        assert_eq!(settings.transfer_initiation_pool_size.value, 8);
        assert_eq!(
            settings.transfer_initiation_pool_size.description(),
            "From CIRRUS_TRANSFER_INITIATION_POOL_SIZE environment variable"
        );
        assert_eq!(settings.max_open_payload_files, 10_000 - 851);
    }

    #[test]
    fn test_resolver_malformed_override_is_fatal() {
        let env = MapEnvironment::new().with(EnvironmentVariable::TRANSFER_INITIATION_POOL_SIZE, "many");
        let err = ConcurrencyResolver::with_cpu_count(&env, 8)
            .resolve(1000)
            .unwrap_err();
        assert!(matches!(err, CirrusError::InvalidOverride { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_detected_cpu_count_is_sane() {
        let env = MapEnvironment::new();
        let resolver = ConcurrencyResolver::new(&env);
        assert!(resolver.cpu_count() >= 1);
    }

    #[test]
    fn test_settings_display_reports_payload_limit() {
        let env = MapEnvironment::new();
        let settings = ConcurrencyResolver::with_cpu_count(&env, 8)
            .resolve(1000)
            .unwrap();
        assert_eq!(settings.max_open_payload_files, 558);
        assert!(settings.to_string().contains("Max open payload files:        558"));
    }
}
