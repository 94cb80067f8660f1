/*!
 * Detection of the process's open-handle ceiling
 *
 * The concurrency resolver needs to know how many files and sockets the
 * process may hold. On unix this is the soft `RLIMIT_NOFILE`; elsewhere a
 * fixed default is used.
 */

use crate::config::{try_configured_value, EnvironmentLookup, EnvironmentVariable};
use crate::error::Result;

/// Ceiling assumed when the OS limit cannot be read
pub const DEFAULT_MAX_FILE_AND_SOCKET_HANDLES: usize = 10_000;

/// Where the handle ceiling came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleLimitSource {
    Environment,
    Config,
    OperatingSystem,
    Default,
}

impl HandleLimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleLimitSource::Environment => "environment",
            HandleLimitSource::Config => "config file",
            HandleLimitSource::OperatingSystem => "OS limit",
            HandleLimitSource::Default => "hard-coded default",
        }
    }
}

/// Resolved handle ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleLimit {
    pub value: usize,
    pub source: HandleLimitSource,
}

/// Resolve the ceiling: environment, then config, then the OS, then the default
pub fn resolve_max_file_and_socket_handles(
    env: &dyn EnvironmentLookup,
    configured: Option<usize>,
) -> Result<HandleLimit> {
    if let Some(value) = try_configured_value(env, EnvironmentVariable::MAX_FILE_HANDLES)? {
        return Ok(HandleLimit {
            value: value.value,
            source: HandleLimitSource::Environment,
        });
    }

    if let Some(value) = configured {
        return Ok(HandleLimit {
            value,
            source: HandleLimitSource::Config,
        });
    }

    Ok(match os_handle_limit() {
        Some(value) => HandleLimit {
            value,
            source: HandleLimitSource::OperatingSystem,
        },
        None => HandleLimit {
            value: DEFAULT_MAX_FILE_AND_SOCKET_HANDLES,
            source: HandleLimitSource::Default,
        },
    })
}

/// Soft open-file limit of this process
#[cfg(unix)]
pub fn os_handle_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "Failed to read RLIMIT_NOFILE"
        );
        return None;
    }

    if limit.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }
    usize::try_from(limit.rlim_cur).ok()
}

#[cfg(not(unix))]
pub fn os_handle_limit() -> Option<usize> {
    None
}
