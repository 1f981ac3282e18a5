//! Task records, creation payloads, and partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attempt ceiling applied when a creation request omits `retries`.
pub const DEFAULT_RETRIES: u32 = 5;

/// Default value for the (currently unused) per-task `delay`, in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 5000;

/// Longest accepted inline input, in characters.
pub const MAX_INPUT_CHARS: usize = 256;

/// How a task's `input` is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// `input` is script source.
    #[default]
    Code,
    /// `input` names a script file inside the data directory.
    File,
}

/// Lifecycle status.
///
/// Allowed moves: `todo → inprogress`, `inprogress → successful | failed`,
/// `failed → inprogress`. `successful` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Failed,
    Successful,
}

impl TaskStatus {
    /// Check if this status may move to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Todo, InProgress) | (InProgress, Successful) | (InProgress, Failed) | (Failed, InProgress)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::InProgress => "inprogress",
            Self::Failed => "failed",
            Self::Successful => "successful",
        };
        write!(f, "{s}")
    }
}

/// A persisted task record.
///
/// This is also the dispatch message sent to a worker process, so the field
/// names on the wire are camelCase (`lastAttempted`, `type`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Store-assigned identity; never reused.
    pub id: String,
    /// Human label.
    pub name: String,
    /// Inline source or a file name relative to the data directory.
    pub input: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Ceiling on total attempts.
    pub retries: u32,
    /// Completed attempts; only the reconciler increments this.
    pub attempts: u32,
    /// Requested retry delay in milliseconds. Accepted and stored, but the
    /// eligibility policy uses a fixed window instead.
    pub delay: u64,
    pub status: TaskStatus,
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted: Option<DateTime<Utc>>,
    /// Value produced by the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure detail from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Task {
    /// True once no further attempts will be scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.retries
    }
}

/// A task creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    pub input: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_delay")]
    pub delay: u64,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted: Option<DateTime<Utc>>,
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_delay() -> u64 {
    DEFAULT_DELAY_MS
}

impl NewTask {
    /// Create a request with default retries, delay, and status.
    pub fn new(name: impl Into<String>, input: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            retries: DEFAULT_RETRIES,
            attempts: 0,
            delay: DEFAULT_DELAY_MS,
            task_type,
            processed: false,
            status: TaskStatus::Todo,
            last_attempted: None,
        }
    }

    /// Builder: set the attempt ceiling.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Check field constraints. Returns every violated rule.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push("Task name is required".to_string());
        }
        if self.input.is_empty() {
            issues.push("Task input is required".to_string());
        }
        if self.input.chars().count() > MAX_INPUT_CHARS {
            issues.push("Task string too long".to_string());
        }
        if self.status == TaskStatus::InProgress {
            issues.push("Task status must be one of todo, failed, successful".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Materialize the record under a freshly assigned id.
    pub fn into_task(self, id: String) -> Task {
        Task {
            id,
            name: self.name,
            input: self.input,
            task_type: self.task_type,
            retries: self.retries,
            attempts: self.attempts,
            delay: self.delay,
            status: self.status,
            processed: self.processed,
            last_attempted: self.last_attempted,
            result: None,
            last_error: None,
        }
    }
}

/// Partial update merged into an existing record. `None` leaves a field as-is.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Replaces the stored result whole; never merged into the old one.
    #[serde(skip)]
    pub result: Option<serde_json::Value>,
    /// `Some(None)` clears the stored error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
}

impl TaskUpdate {
    /// Update that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::Todo.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Successful));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));

        assert!(!TaskStatus::Successful.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Todo.can_transition_to(TaskStatus::Successful));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Successful));
        assert!(TaskStatus::Successful.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
        assert_eq!(TaskStatus::Successful.to_string(), "successful");
    }

    #[test]
    fn new_task_defaults_from_json() {
        let req: NewTask =
            serde_json::from_str(r#"{"name": "t1", "input": "1+1"}"#).unwrap();
        assert_eq!(req.retries, DEFAULT_RETRIES);
        assert_eq!(req.attempts, 0);
        assert_eq!(req.delay, DEFAULT_DELAY_MS);
        assert_eq!(req.task_type, TaskType::Code);
        assert_eq!(req.status, TaskStatus::Todo);
        assert!(!req.processed);
    }

    #[test]
    fn validation_collects_every_issue() {
        let req = NewTask::new("", "x".repeat(MAX_INPUT_CHARS + 1), TaskType::Code);
        let issues = req.validate().unwrap_err();
        assert_eq!(issues.len(), 2);
        assert!(issues.contains(&"Task name is required".to_string()));
        assert!(issues.contains(&"Task string too long".to_string()));
    }

    #[test]
    fn validation_rejects_inprogress_status() {
        let mut req = NewTask::new("t", "1", TaskType::Code);
        req.status = TaskStatus::InProgress;
        assert!(req.validate().is_err());
    }

    #[test]
    fn record_uses_camel_case_on_the_wire() {
        let mut task = NewTask::new("t1", "1+1", TaskType::File).into_task("abc".into());
        task.last_attempted = Some(Utc::now());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "file");
        assert!(json.get("lastAttempted").is_some());
        assert!(json.get("result").is_none());
    }

    #[test]
    fn update_serializes_only_set_fields() {
        let update = TaskUpdate {
            attempts: Some(2),
            last_error: Some(None),
            ..TaskUpdate::status(TaskStatus::Failed)
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "failed", "attempts": 2, "lastError": null})
        );
    }
}
