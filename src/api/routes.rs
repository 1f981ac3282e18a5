//! Task CRUD endpoints and script upload.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::ApiState;
use crate::error::StoreError;
use crate::tasks::{NewTask, Task, TaskType};
use crate::worker::paths::resolve_data_path;

/// Extension an uploaded script must carry.
pub const SCRIPT_EXTENSION: &str = "rhai";

// ── Responses ───────────────────────────────────────────────────────────

fn task_response(task: Task) -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": StatusCode::OK.as_u16(), "task": task})),
    )
        .into_response()
}

fn store_failure(status: StatusCode, err: &StoreError) -> Response {
    (
        status,
        Json(json!({
            "status": status.as_u16(),
            "type": err.kind(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

fn validation_failure(errors: Vec<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"type": "validation-error", "errors": errors})),
    )
        .into_response()
}

/// Decode and validate a creation payload.
fn parse_new_task(body: Value) -> Result<NewTask, Vec<String>> {
    let new_task: NewTask = serde_json::from_value(body).map_err(|e| vec![e.to_string()])?;
    new_task.validate()?;
    Ok(new_task)
}

// ── Health ──────────────────────────────────────────────────────────────

pub(super) async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── CRUD ────────────────────────────────────────────────────────────────

/// POST /
pub(super) async fn create_task(State(state): State<ApiState>, Json(body): Json<Value>) -> Response {
    let new_task = match parse_new_task(body) {
        Ok(t) => t,
        Err(errors) => return validation_failure(errors),
    };

    match state.store.add(new_task).await {
        Ok(task) => {
            info!(task_id = %task.id, name = %task.name, "Task created");
            task_response(task)
        }
        Err(e) => {
            warn!(error = %e, "Failed to create task");
            store_failure(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// GET /{task_id}
pub(super) async fn get_task(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    match state.store.get(&task_id).await {
        Ok(task) => task_response(task),
        Err(e) if e.kind() == "read-error" => store_failure(StatusCode::NOT_FOUND, &e),
        Err(e) => store_failure(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// DELETE /{task_id}
///
/// Also removes the uploaded script of a `file` task.
pub(super) async fn delete_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Response {
    let task = match state.store.delete(&task_id).await {
        Ok(task) => task,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to delete task");
            return store_failure(StatusCode::INTERNAL_SERVER_ERROR, &e);
        }
    };

    if task.task_type == TaskType::File {
        if let Ok(path) = resolve_data_path(&state.data_dir, &task.input) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(task_id = %task_id, path = %path.display(), "Removed uploaded script"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to remove uploaded script"),
            }
        }
    }

    info!(task_id = %task_id, "Task deleted");
    task_response(task)
}

// ── Upload ──────────────────────────────────────────────────────────────

/// Convert a multipart text field to the JSON type the task schema expects.
fn form_value(name: &str, text: String) -> Value {
    match name {
        "retries" | "attempts" | "delay" => text
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "processed" => text
            .trim()
            .parse::<bool>()
            .map(Value::Bool)
            .unwrap_or(Value::String(text)),
        _ => Value::String(text),
    }
}

/// Check an uploaded script and return its text.
fn check_script(file_name: &str, bytes: &[u8], max_bytes: usize) -> Result<String, String> {
    let is_script = std::path::Path::new(file_name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SCRIPT_EXTENSION));
    if !is_script {
        return Err(format!("Uploaded file must be a .{SCRIPT_EXTENSION} script"));
    }
    if bytes.len() > max_bytes {
        return Err(format!("Uploaded file exceeds {max_bytes} bytes"));
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| "Uploaded file is not valid UTF-8".to_string())
}

/// PUT /
///
/// Multipart form with a `file` part holding the script; the remaining
/// text parts are task fields. The task is always created as a `file` task
/// whose input is the stored file name.
pub(super) async fn upload_task(State(state): State<ApiState>, mut multipart: Multipart) -> Response {
    let mut fields = Map::new();
    let mut script: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return validation_failure(vec![format!("Malformed upload: {e}")]),
        };
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = match field.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => return validation_failure(vec![format!("Malformed upload: {e}")]),
            };
            match check_script(&file_name, &bytes, state.max_upload_bytes) {
                Ok(text) => script = Some(text),
                Err(message) => return validation_failure(vec![message]),
            }
        } else {
            match field.text().await {
                Ok(text) => {
                    fields.insert(name.clone(), form_value(&name, text));
                }
                Err(e) => return validation_failure(vec![format!("Malformed upload: {e}")]),
            }
        }
    }

    let Some(script) = script else {
        return validation_failure(vec!["File was not uploaded".to_string()]);
    };

    let stored_name = format!("{}.{SCRIPT_EXTENSION}", Uuid::new_v4().simple());
    fields.insert("type".to_string(), json!("file"));
    fields.insert("input".to_string(), json!(stored_name));

    let new_task = match parse_new_task(Value::Object(fields)) {
        Ok(t) => t,
        Err(errors) => return validation_failure(errors),
    };

    let path = state.data_dir.join(&stored_name);
    let written = match tokio::fs::create_dir_all(&state.data_dir).await {
        Ok(()) => tokio::fs::write(&path, script).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        warn!(path = %path.display(), error = %e, "Failed to store uploaded script");
        let err = StoreError::Write(format!("store upload: {e}"));
        return store_failure(StatusCode::INTERNAL_SERVER_ERROR, &err);
    }

    match state.store.add(new_task).await {
        Ok(task) => {
            info!(task_id = %task.id, file = %stored_name, "File task created");
            task_response(task)
        }
        Err(e) => {
            warn!(error = %e, "Failed to create file task");
            let _ = tokio::fs::remove_file(&path).await;
            store_failure(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}
