//! libSQL implementation of `TaskStore`.
//!
//! One row per task, keyed by id, holding the JSON task document. Supports
//! local file and in-memory databases.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{TaskStore, TaskStream};
use crate::tasks::{NewTask, Task, TaskUpdate};

/// Rows fetched per round trip while scanning.
const SCAN_PAGE_SIZE: i64 = 64;

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn decode_record(id: &str, record: &str) -> Result<Task, StoreError> {
    serde_json::from_str(record).map_err(|e| StoreError::Serialization {
        id: id.to_string(),
        message: e.to_string(),
    })
}

/// Read a single `record` column from the first row, if any.
async fn first_record(rows: &mut libsql::Rows, op: &str) -> Result<Option<String>, StoreError> {
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<String>(0)
            .map(Some)
            .map_err(|e| StoreError::Read(format!("{op} row parse: {e}"))),
        Ok(None) => Ok(None),
        Err(e) => Err(StoreError::Read(format!("{op}: {e}"))),
    }
}

/// Fetch the page of records whose ids sort after `cursor`.
async fn fetch_page(conn: &Connection, cursor: &str) -> Result<Vec<(String, String)>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT id, record FROM tasks WHERE id > ?1 ORDER BY id LIMIT ?2",
            params![cursor, SCAN_PAGE_SIZE],
        )
        .await
        .map_err(|e| StoreError::Read(format!("scan: {e}")))?;

    let mut page = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| StoreError::Read(format!("scan id: {e}")))?;
                let record: String = row
                    .get(1)
                    .map_err(|e| StoreError::Read(format!("scan record: {e}")))?;
                page.push((id, record));
            }
            Ok(None) => break,
            Err(e) => return Err(StoreError::Read(format!("scan: {e}"))),
        }
    }
    Ok(page)
}

/// Keyset-paginated cursor over the `tasks` table.
struct Scan {
    conn: Connection,
    cursor: String,
    buffered: VecDeque<Result<(String, Task), StoreError>>,
    exhausted: bool,
}

impl Scan {
    async fn next_item(&mut self) -> Option<Result<(String, Task), StoreError>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }

            match fetch_page(&self.conn, &self.cursor).await {
                Ok(page) => {
                    self.exhausted = (page.len() as i64) < SCAN_PAGE_SIZE;
                    if let Some((last_id, _)) = page.last() {
                        self.cursor = last_id.clone();
                    }
                    self.buffered.extend(
                        page.into_iter()
                            .map(|(id, record)| decode_record(&id, &record).map(|t| (id, t))),
                    );
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn add(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let conn = self.conn();
        let id = Uuid::new_v4().to_string();
        let task = new_task.into_task(id.clone());
        let record = serde_json::to_string(&task)
            .map_err(|e| StoreError::Write(format!("add: encode record: {e}")))?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO tasks (id, record, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id.as_str(), record, now],
        )
        .await
        .map_err(|e| StoreError::Write(format!("add: {e}")))?;

        debug!(task_id = %id, "Task inserted into store");
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT record FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Read(format!("get: {e}")))?;

        match first_record(&mut rows, "get").await? {
            Some(record) => decode_record(id, &record),
            None => Err(StoreError::NotFound { id: id.to_string() }),
        }
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let conn = self.conn();
        let patch = serde_json::to_string(&update)
            .map_err(|e| StoreError::Write(format!("update: encode patch: {e}")))?;
        let result = match &update.result {
            Some(value) => libsql::Value::Text(
                serde_json::to_string(value)
                    .map_err(|e| StoreError::Write(format!("update: encode result: {e}")))?,
            ),
            None => libsql::Value::Null,
        };
        let now = Utc::now().to_rfc3339();

        // Scalars go through json_patch. `result` is set whole, since a merge
        // patch would drop its null members and merge nested objects.
        let mut rows = conn
            .query(
                "UPDATE tasks SET record = CASE WHEN ?2 IS NULL THEN json_patch(record, ?1) \
                 ELSE json_set(json_patch(record, ?1), '$.result', json(?2)) END, \
                 updated_at = ?3 WHERE id = ?4 RETURNING record",
                params![patch.as_str(), result, now, id],
            )
            .await
            .map_err(|e| StoreError::Write(format!("update: {e}")))?;

        match first_record(&mut rows, "update").await? {
            Some(record) => {
                debug!(task_id = %id, patch = %patch, "Task updated in store");
                decode_record(id, &record)
            }
            None => Err(StoreError::NotFound { id: id.to_string() }),
        }
    }

    async fn delete(&self, id: &str) -> Result<Task, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "DELETE FROM tasks WHERE id = ?1 RETURNING record",
                params![id],
            )
            .await
            .map_err(|e| StoreError::Write(format!("delete: {e}")))?;

        let record = first_record(&mut rows, "delete")
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?
            .ok_or_else(|| StoreError::Write(format!("No such task with ID {id}")))?;

        debug!(task_id = %id, "Task deleted from store");
        decode_record(id, &record)
    }

    fn iterate(&self) -> TaskStream {
        let scan = Scan {
            conn: self.conn.clone(),
            cursor: String::new(),
            buffered: VecDeque::new(),
            exhausted: false,
        };

        futures::stream::unfold(scan, |mut scan| async move {
            let item = scan.next_item().await?;
            Some((item, scan))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::tasks::{TaskStatus, TaskType};

    async fn test_store() -> LibSqlTaskStore {
        LibSqlTaskStore::new_memory().await.unwrap()
    }

    fn new_task(name: &str) -> NewTask {
        NewTask::new(name, "1+1", TaskType::Code).with_retries(3)
    }

    #[tokio::test]
    async fn add_assigns_fresh_ids() {
        let store = test_store().await;
        let a = store.add(new_task("a")).await.unwrap();
        let b = store.add(new_task("b")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.status, TaskStatus::Todo);
        assert_eq!(a.attempts, 0);
    }

    #[tokio::test]
    async fn add_and_get() {
        let store = test_store().await;
        let created = store.add(new_task("t1")).await.unwrap();

        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn get_missing_is_read_error() {
        let store = test_store().await;
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.kind(), "read-error");
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = test_store().await;
        let created = store.add(new_task("t1")).await.unwrap();

        let updated = store
            .update(
                &created.id,
                TaskUpdate {
                    attempts: Some(1),
                    result: Some(serde_json::json!({"answer": 2})),
                    ..TaskUpdate::status(TaskStatus::Successful)
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Successful);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.result, Some(serde_json::json!({"answer": 2})));
        assert_eq!(updated.name, "t1");
        assert_eq!(store.get(&created.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn update_stores_result_verbatim() {
        let store = test_store().await;
        let created = store.add(new_task("t1")).await.unwrap();

        let first = serde_json::json!({"a": 1, "c": {"x": true}});
        store
            .update(
                &created.id,
                TaskUpdate {
                    result: Some(first),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let value = serde_json::json!({"a": null, "b": 1, "c": {"d": null}, "list": [null, 2]});
        let updated = store
            .update(
                &created.id,
                TaskUpdate {
                    result: Some(value.clone()),
                    ..TaskUpdate::status(TaskStatus::Successful)
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.result, Some(value.clone()));
        assert_eq!(updated.status, TaskStatus::Successful);
        assert_eq!(store.get(&created.id).await.unwrap().result, Some(value));
    }

    #[tokio::test]
    async fn update_without_result_keeps_it() {
        let store = test_store().await;
        let created = store.add(new_task("t1")).await.unwrap();
        store
            .update(
                &created.id,
                TaskUpdate {
                    result: Some(serde_json::json!([1, 2])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store
            .update(&created.id, TaskUpdate::status(TaskStatus::Failed))
            .await
            .unwrap();
        assert_eq!(updated.result, Some(serde_json::json!([1, 2])));
    }

    #[tokio::test]
    async fn update_can_clear_last_error() {
        let store = test_store().await;
        let created = store.add(new_task("t1")).await.unwrap();

        let failed = store
            .update(
                &created.id,
                TaskUpdate {
                    last_error: Some(Some("boom".into())),
                    ..TaskUpdate::status(TaskStatus::Failed)
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        let cleared = store
            .update(
                &created.id,
                TaskUpdate {
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.last_error.is_none());
        assert_eq!(cleared.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn update_missing_is_read_error() {
        let store = test_store().await;
        let err = store
            .update("nope", TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_returns_record() {
        let store = test_store().await;
        let created = store.add(new_task("t1")).await.unwrap();

        let deleted = store.delete(&created.id).await.unwrap();
        assert_eq!(deleted.id, created.id);
        assert!(store.get(&created.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_write_error() {
        let store = test_store().await;
        let err = store.delete("nope").await.unwrap_err();
        assert_eq!(err.kind(), "write-error");
    }

    #[tokio::test]
    async fn iterate_spans_multiple_pages() {
        let store = test_store().await;
        let total = SCAN_PAGE_SIZE as usize * 2 + 5;
        for i in 0..total {
            store.add(new_task(&format!("t{i}"))).await.unwrap();
        }

        let all: Vec<(String, Task)> = store.iterate().try_collect().await.unwrap();
        assert_eq!(all.len(), total);
        assert!(all.iter().all(|(id, task)| *id == task.id));

        let mut ids: Vec<&String> = all.iter().map(|(id, _)| id).collect();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[tokio::test]
    async fn iterate_empty_store() {
        let store = test_store().await;
        let all: Vec<(String, Task)> = store.iterate().try_collect().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn iterate_yields_decode_errors_per_record() {
        let store = test_store().await;
        store.add(new_task("good")).await.unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO tasks (id, record, created_at, updated_at) VALUES ('zzz', 'not json', '', '')",
                (),
            )
            .await
            .unwrap();

        let items: Vec<_> = store.iterate().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|i| i.is_ok()));
        assert!(matches!(
            items.iter().find(|i| i.is_err()),
            Some(Err(StoreError::Serialization { .. }))
        ));
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("tasks.db");
        let store = LibSqlTaskStore::new_local(&db_path).await.unwrap();
        store.add(new_task("t1")).await.unwrap();
        assert!(db_path.exists());
    }
}
