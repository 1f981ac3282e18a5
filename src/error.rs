//! Error types for taskq.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task store errors.
///
/// The store only distinguishes two failure kinds towards its callers:
/// `read-error` (the record is absent or unreadable) and `write-error`
/// (the store rejected a mutation).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No such task with ID {id}")]
    NotFound { id: String },

    #[error("Could not read from store: {0}")]
    Read(String),

    #[error("Could not write to store: {0}")]
    Write(String),

    #[error("Malformed task record {id}: {message}")]
    Serialization { id: String, message: String },

    #[error("Could not open store: {0}")]
    Open(String),
}

impl StoreError {
    /// Error kind as exposed over the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::Read(_) | Self::Serialization { .. } => "read-error",
            Self::Write(_) => "write-error",
            Self::Open(_) => "unknown",
        }
    }

    /// True when the failure means the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised while launching or talking to a worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker for task {task_id}: {reason}")]
    SpawnFailed { task_id: String, reason: String },

    #[error("Worker protocol violation: {0}")]
    Protocol(String),

    #[error("Worker for task {task_id} is already running")]
    AlreadyRunning { task_id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single sandboxed evaluation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Evaluation failed: {message}")]
    Execution { message: String },

    #[error("Timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Could not read payload {path}: {message}")]
    PayloadRead { path: PathBuf, message: String },

    #[error("Path {path} escapes the data directory")]
    PathRejected { path: String },
}

/// Scheduler loop errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The full-store scan itself failed. Fatal for the scheduler process.
    #[error("Task store iteration failed: {0}")]
    Iteration(StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_kinds() {
        let missing = StoreError::NotFound { id: "abc".into() };
        assert_eq!(missing.kind(), "read-error");
        assert!(missing.is_not_found());
        assert_eq!(StoreError::Write("disk full".into()).kind(), "write-error");
        assert!(!StoreError::Write("disk full".into()).is_not_found());
    }

    #[test]
    fn errors_convert_into_top_level() {
        let err: Error = StoreError::Write("disk full".into()).into();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(err.to_string(), "Store error: Could not write to store: disk full");

        let err: Error = SchedulerError::Iteration(StoreError::Read("gone".into())).into();
        assert!(err.to_string().starts_with("Scheduler error: Task store iteration failed"));
    }

    #[test]
    fn not_found_message_names_id() {
        let err = StoreError::NotFound { id: "abc".into() };
        assert_eq!(err.to_string(), "No such task with ID abc");
    }
}
