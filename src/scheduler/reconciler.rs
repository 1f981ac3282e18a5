//! Folds worker outcomes back into task records.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::store::TaskStore;
use crate::tasks::{Task, TaskStatus, TaskUpdate};
use crate::worker::{Outcome, OutcomeMessage};

/// Applies outcome messages to the store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TaskStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Apply one outcome. Returns the updated record, or `None` when the
    /// task is gone or the write failed. Failures are logged, not retried.
    pub async fn reconcile(&self, message: OutcomeMessage) -> Option<Task> {
        let OutcomeMessage { id, outcome } = message;

        let current = match self.store.get(&id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %id, error = %e, kind = e.kind(), "Outcome for unreadable task dropped");
                return None;
            }
        };

        let target = if outcome.is_success() {
            TaskStatus::Successful
        } else {
            TaskStatus::Failed
        };
        if !current.status.can_transition_to(target) {
            debug!(
                task_id = %id,
                from = %current.status,
                to = %target,
                "Reconciling from unexpected status"
            );
        }

        let attempts = current.attempts.saturating_add(1);
        let update = match &outcome {
            Outcome::Success { value } => TaskUpdate {
                attempts: Some(attempts),
                result: Some(value.clone()),
                last_error: Some(None),
                ..TaskUpdate::status(target)
            },
            Outcome::Failure { error, .. } => TaskUpdate {
                attempts: Some(attempts),
                last_error: Some(Some(error.describe())),
                ..TaskUpdate::status(target)
            },
        };

        match self.store.update(&id, update).await {
            Ok(updated) => {
                match &outcome {
                    Outcome::Success { .. } => {
                        info!(task_id = %id, attempts, "Task succeeded");
                    }
                    Outcome::Failure { error, partial } => {
                        info!(
                            task_id = %id,
                            attempts,
                            kind = %error.kind,
                            error = %error.message,
                            has_partial = partial.is_some(),
                            "Task attempt failed"
                        );
                        if updated.is_exhausted() {
                            info!(task_id = %id, retries = updated.retries, "Task retries exhausted");
                        }
                    }
                }
                Some(updated)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to record task outcome");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::LibSqlTaskStore;
    use crate::tasks::{NewTask, TaskType};
    use crate::worker::FailureKind;

    async fn setup(retries: u32) -> (Reconciler, Arc<dyn TaskStore>, Task) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
        let task = store
            .add(NewTask::new("t", "1+1", TaskType::Code).with_retries(retries))
            .await
            .unwrap();
        store
            .update(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap();
        (Reconciler::new(store.clone()), store, task)
    }

    #[tokio::test]
    async fn success_records_value_and_attempt() {
        let (reconciler, store, task) = setup(3).await;

        let updated = reconciler
            .reconcile(OutcomeMessage::new(&task.id, Outcome::Success { value: json!(2) }))
            .await
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Successful);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.result, Some(json!(2)));
        assert_eq!(store.get(&task.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn success_keeps_null_members_of_value() {
        let (reconciler, store, task) = setup(3).await;
        let value = json!({"a": null, "b": 1, "c": {"d": null}});

        let updated = reconciler
            .reconcile(OutcomeMessage::new(
                &task.id,
                Outcome::Success {
                    value: value.clone(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(updated.result, Some(value.clone()));
        assert_eq!(store.get(&task.id).await.unwrap().result, Some(value));
    }

    #[tokio::test]
    async fn failure_records_error_and_attempt() {
        let (reconciler, _store, task) = setup(3).await;

        let updated = reconciler
            .reconcile(OutcomeMessage::new(
                &task.id,
                Outcome::failure(FailureKind::Execution, "boom"),
            ))
            .await
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Failed);
        assert_eq!(updated.attempts, 1);
        assert!(updated.result.is_none());
        assert_eq!(updated.last_error.as_deref(), Some("execution-error: boom"));
    }

    #[tokio::test]
    async fn success_after_failure_clears_error() {
        let (reconciler, _store, task) = setup(3).await;
        reconciler
            .reconcile(OutcomeMessage::new(
                &task.id,
                Outcome::failure(FailureKind::Timeout, "slow"),
            ))
            .await
            .unwrap();

        let updated = reconciler
            .reconcile(OutcomeMessage::new(&task.id, Outcome::Success { value: json!("ok") }))
            .await
            .unwrap();
        assert_eq!(updated.attempts, 2);
        assert!(updated.last_error.is_none());
    }

    #[tokio::test]
    async fn missing_task_is_dropped() {
        let (reconciler, store, task) = setup(3).await;
        store.delete(&task.id).await.unwrap();

        let result = reconciler
            .reconcile(OutcomeMessage::new(&task.id, Outcome::Success { value: json!(1) }))
            .await;
        assert!(result.is_none());
        assert!(store.get(&task.id).await.is_err());
    }
}
