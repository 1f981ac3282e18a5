//! Scheduler-owned map from task id to live worker.
//!
//! An entry exists from dispatch until teardown after the grace period, so
//! membership is the single-flight guard.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::WorkerError;
use crate::worker::WorkerHandle;

/// Shared handle to the id → worker map. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a worker is registered for `task_id`.
    pub async fn contains(&self, task_id: &str) -> bool {
        self.workers.lock().await.contains_key(task_id)
    }

    /// Number of registered workers.
    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// Register a worker. Fails if one is already registered for the task.
    pub async fn insert(&self, handle: WorkerHandle) -> Result<(), WorkerError> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&handle.task_id) {
            return Err(WorkerError::AlreadyRunning {
                task_id: handle.task_id.clone(),
            });
        }
        workers.insert(handle.task_id.clone(), handle);
        Ok(())
    }

    /// Remove and return the worker for `task_id`.
    pub async fn remove(&self, task_id: &str) -> Option<WorkerHandle> {
        self.workers.lock().await.remove(task_id)
    }

    /// Remove every worker and terminate each one.
    pub async fn terminate_all(&self) -> usize {
        let drained: Vec<WorkerHandle> = self.workers.lock().await.drain().map(|(_, h)| h).collect();
        let count = drained.len();
        for handle in drained {
            handle.terminate().await;
        }
        count
    }
}
