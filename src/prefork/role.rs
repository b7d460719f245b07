//! Coordinator/worker role detection.
//!
//! The coordinator tags every worker it spawns with a single environment
//! variable. That variable is the only thing carried across the exec
//! boundary, so classification is a pure function of the environment.

use std::ffi::OsStr;

/// Environment variable set on every spawned worker.
pub const WORKER_ENV_KEY: &str = "PREFORK_WORKER";

/// Sentinel value of [`WORKER_ENV_KEY`] marking a worker.
pub const WORKER_ENV_VALUE: &str = "1";

/// Role of the current process within a prefork group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// The originally invoked process; spawns and supervises workers.
    Coordinator,
    /// A spawned copy that binds the shared address and serves.
    Worker,
}

impl ProcessRole {
    /// Classify the current process from its environment.
    pub fn detect() -> Self {
        Self::from_marker(std::env::var_os(WORKER_ENV_KEY).as_deref())
    }

    /// Classify from the raw marker value. Only an exact sentinel match is a worker.
    pub fn from_marker(value: Option<&OsStr>) -> Self {
        match value {
            Some(v) if v == OsStr::new(WORKER_ENV_VALUE) => Self::Worker,
            _ => Self::Coordinator,
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker)
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => write!(f, "coordinator"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Returns true iff this process was spawned as a prefork worker.
pub fn is_worker() -> bool {
    ProcessRole::detect().is_worker()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_from_marker_exact_match() {
        assert_eq!(
            ProcessRole::from_marker(Some(OsStr::new("1"))),
            ProcessRole::Worker
        );
    }

    #[test]
    fn test_from_marker_rejects_other_values() {
        for value in ["", "0", "true", " 1", "11"] {
            assert_eq!(
                ProcessRole::from_marker(Some(OsStr::new(value))),
                ProcessRole::Coordinator,
                "value {:?} must not classify as worker",
                value
            );
        }
        assert_eq!(ProcessRole::from_marker(None), ProcessRole::Coordinator);
    }

    #[test]
    #[serial]
    fn test_detect_reads_environment() {
        // Safety: serialized with every other test touching the marker.
        unsafe { std::env::set_var(WORKER_ENV_KEY, WORKER_ENV_VALUE) };
        assert!(is_worker());

        unsafe { std::env::remove_var(WORKER_ENV_KEY) };
        assert!(!is_worker());
    }

    #[test]
    #[serial]
    fn test_detect_is_stable() {
        let first = ProcessRole::detect();
        for _ in 0..100 {
            assert_eq!(ProcessRole::detect(), first);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessRole::Worker.to_string(), "worker");
        assert_eq!(ProcessRole::Coordinator.to_string(), "coordinator");
    }
}
