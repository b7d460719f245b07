//! Error types for prefork.

use thiserror::Error;

use crate::prefork::signals::TerminationReason;

/// Main error type for prefork.
#[derive(Error, Debug)]
pub enum PreforkError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start a worker process, error: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to wait for worker {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {pid} {reason}")]
    WorkerExited { pid: u32, reason: TerminationReason },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, PreforkError>;
