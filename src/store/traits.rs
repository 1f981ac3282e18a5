//! The persistence interface the scheduler consumes.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::tasks::{NewTask, Task, TaskUpdate};

/// Lazy full-store scan yielding `(id, task)` pairs.
///
/// Items that fail to decode are yielded as `Err(StoreError::Serialization)`;
/// any other `Err` means the scan itself broke.
pub type TaskStream = BoxStream<'static, Result<(String, Task), StoreError>>;

/// Backend-agnostic task persistence.
///
/// Every call is atomic with respect to its own key only; there are no
/// multi-key transactions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record under a freshly assigned id.
    async fn add(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Fetch a record. Missing ids fail with `StoreError::NotFound`.
    async fn get(&self, id: &str) -> Result<Task, StoreError>;

    /// Merge `update` into an existing record and return the result.
    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError>;

    /// Remove a record and return what was stored.
    async fn delete(&self, id: &str) -> Result<Task, StoreError>;

    /// Scan every record. Concurrent writes may or may not be observed.
    fn iterate(&self) -> TaskStream;
}
