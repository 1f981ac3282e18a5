//! Outcome messages exchanged between a worker process and the scheduler.
//!
//! The dispatch side is just the [`Task`](crate::tasks::Task) record encoded
//! as one JSON line. The reply is one [`OutcomeMessage`] line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

/// Coarse failure category carried in a failure outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload raised, or its file could not be read.
    Execution,
    /// Payload exceeded the wall-clock bound.
    Timeout,
    /// The worker process went away without reporting.
    WorkerLost,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Execution => "execution-error",
            Self::Timeout => "timeout-error",
            Self::WorkerLost => "worker-lost",
        };
        write!(f, "{s}")
    }
}

/// Failure detail, kept verbatim for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The text persisted as the task's `lastError`.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

impl From<&SandboxError> for TaskFailure {
    fn from(err: &SandboxError) -> Self {
        let kind = match err {
            SandboxError::Timeout { .. } => FailureKind::Timeout,
            SandboxError::Execution { .. }
            | SandboxError::PayloadRead { .. }
            | SandboxError::PathRejected { .. } => FailureKind::Execution,
        };
        Self::new(kind, err.to_string())
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default)]
        value: Value,
    },
    Failure {
        error: TaskFailure,
        /// Whatever the payload assigned to `result` before it failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<Value>,
    },
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            error: TaskFailure::new(kind, message),
            partial: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// The single message a worker sends back for a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMessage {
    pub id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl OutcomeMessage {
    pub fn new(id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id: id.into(),
            outcome,
        }
    }

    /// Synthesised when a worker ends without reporting.
    pub fn lost(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, Outcome::failure(FailureKind::WorkerLost, message))
    }
}
