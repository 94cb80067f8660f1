//! Job identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique identifier of one transfer job
///
/// Used as the telemetry session id and as the base name of the job's log
/// file. Created by the host; loggers only read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// `<job-id>.log`
    pub fn log_file_name(&self) -> String {
        format!("{}.log", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_parse_and_file_name() {
        let id: JobId = "6f1b2c7e-3d44-4e5a-9a0b-1c2d3e4f5a6b".parse().unwrap();
        assert_eq!(id.log_file_name(), "6f1b2c7e-3d44-4e5a-9a0b-1c2d3e4f5a6b.log");
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-job".parse::<JobId>().is_err());
    }
}
