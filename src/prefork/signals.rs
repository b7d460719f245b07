//! Exit analysis for worker processes.
//!
//! Turns the raw `ExitStatus` reported by the OS into a reason that can be
//! logged and carried inside [`PreforkError::WorkerExited`].
//!
//! [`PreforkError::WorkerExited`]: crate::error::PreforkError::WorkerExited

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Killed by a signal number `nix` does not know about.
    UnknownSignal(i32),
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Analyze an `ExitStatus` to determine the termination reason.
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        match status.signal() {
            Some(raw) => Signal::try_from(raw)
                .map(Self::Signaled)
                .unwrap_or(Self::UnknownSignal(raw)),
            None => Self::Unknown,
        }
    }

    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig),
            Self::UnknownSignal(raw) => format!("killed by signal {}", raw),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_analysis() {
        // Wait status encodes the exit code in the second byte.
        let reason = TerminationReason::from_status(ExitStatus::from_raw(3 << 8));
        assert_eq!(reason, TerminationReason::Exited(3));
        assert!(!reason.is_success());

        let reason = TerminationReason::from_status(ExitStatus::from_raw(0));
        assert!(reason.is_success());
    }

    #[test]
    fn test_signal_analysis() {
        let reason = TerminationReason::from_status(ExitStatus::from_raw(libc::SIGKILL));
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGKILL));
        assert!(reason.to_string().contains("SIGKILL"));
    }

    #[test]
    fn test_description() {
        assert_eq!(
            TerminationReason::Exited(1).description(),
            "exited with code 1"
        );
        assert!(TerminationReason::Unknown.description().contains("unknown"));
    }
}
