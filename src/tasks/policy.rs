//! Eligibility policy: decides whether a task should be dispatched now.
//!
//! The policy is a pure function of the record and the current time. It
//! never consults the per-task `delay`; the retry window is the fixed
//! [`RETRY_BACKOFF`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::model::{Task, TaskStatus};

/// Minimum time since `lastAttempted` before a task may run again.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(5000);

/// Why a task was or was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// A worker already owns it.
    InProgress,
    /// Finished successfully.
    Completed,
    /// `attempts >= retries`. Covers `retries == 0`, which never runs.
    NoAttemptsLeft,
    /// Last attempt started less than [`RETRY_BACKOFF`] ago.
    BackingOff,
}

impl Eligibility {
    /// Classify `task` at time `now`.
    pub fn of(task: &Task, now: DateTime<Utc>) -> Self {
        match task.status {
            TaskStatus::InProgress => return Self::InProgress,
            TaskStatus::Successful => return Self::Completed,
            TaskStatus::Todo | TaskStatus::Failed => {}
        }

        if task.attempts >= task.retries {
            return Self::NoAttemptsLeft;
        }

        if let Some(last) = task.last_attempted {
            // A timestamp in the future also counts as recent.
            let since = now.signed_duration_since(last);
            if since.num_milliseconds() < RETRY_BACKOFF.as_millis() as i64 {
                return Self::BackingOff;
            }
        }

        Self::Eligible
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

impl std::fmt::Display for Eligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eligible => "eligible",
            Self::InProgress => "in progress",
            Self::Completed => "completed",
            Self::NoAttemptsLeft => "no attempts left",
            Self::BackingOff => "backing off",
        };
        write!(f, "{s}")
    }
}

/// True if `task` should be dispatched at `now`.
pub fn should_process(task: &Task, now: DateTime<Utc>) -> bool {
    Eligibility::of(task, now).is_eligible()
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::tasks::model::{NewTask, TaskType};

    fn task(status: TaskStatus, attempts: u32, retries: u32) -> Task {
        let mut t = NewTask::new("t", "1+1", TaskType::Code)
            .with_retries(retries)
            .into_task("id-1".into());
        t.status = status;
        t.attempts = attempts;
        t
    }

    #[test]
    fn todo_and_failed_with_attempts_left_are_eligible() {
        let now = Utc::now();
        assert!(should_process(&task(TaskStatus::Todo, 0, 3), now));
        assert!(should_process(&task(TaskStatus::Failed, 2, 3), now));
    }

    #[test]
    fn inprogress_is_never_eligible() {
        let now = Utc::now();
        let t = task(TaskStatus::InProgress, 0, 3);
        assert_eq!(Eligibility::of(&t, now), Eligibility::InProgress);
        assert!(!should_process(&t, now));
    }

    #[test]
    fn successful_is_never_eligible() {
        assert!(!should_process(&task(TaskStatus::Successful, 1, 3), Utc::now()));
    }

    #[test]
    fn zero_retries_never_runs() {
        let now = Utc::now();
        let t = task(TaskStatus::Todo, 0, 0);
        assert_eq!(Eligibility::of(&t, now), Eligibility::NoAttemptsLeft);
        assert!(!should_process(&task(TaskStatus::Failed, 0, 0), now));
    }

    #[test]
    fn exhausted_failed_task_stops() {
        assert!(!should_process(&task(TaskStatus::Failed, 3, 3), Utc::now()));
    }

    #[test]
    fn recent_attempt_backs_off() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Failed, 1, 3);

        t.last_attempted = Some(now - ChronoDuration::milliseconds(4999));
        assert_eq!(Eligibility::of(&t, now), Eligibility::BackingOff);

        t.last_attempted = Some(now - ChronoDuration::milliseconds(5000));
        assert!(should_process(&t, now));
    }

    #[test]
    fn future_timestamp_backs_off() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Todo, 0, 3);
        t.last_attempted = Some(now + ChronoDuration::seconds(60));
        assert!(!should_process(&t, now));
    }

    #[test]
    fn delay_field_is_not_consulted() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Failed, 1, 3);
        t.delay = 60_000;
        t.last_attempted = Some(now - ChronoDuration::seconds(6));
        assert!(should_process(&t, now));
    }
}
