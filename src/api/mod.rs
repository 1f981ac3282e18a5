//! HTTP front end for creating, reading, deleting, and uploading tasks.
//!
//! Talks to the scheduler only through the task store.

pub mod routes;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{ApiConfig, SandboxConfig};
use crate::store::TaskStore;

/// Room for multipart framing and text fields on top of the script itself.
const FORM_OVERHEAD_BYTES: usize = 16 * 1024;

/// Shared state for the task routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn TaskStore>,
    /// Where uploaded scripts are written.
    pub data_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl ApiState {
    pub fn new(store: Arc<dyn TaskStore>, api: &ApiConfig, sandbox: &SandboxConfig) -> Self {
        Self {
            store,
            data_dir: sandbox.data_dir.clone(),
            max_upload_bytes: api.max_upload_bytes,
        }
    }
}

/// Build the Axum router for the task API.
pub fn router(state: ApiState) -> Router {
    let body_limit = state.max_upload_bytes + FORM_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(routes::health))
        .route("/", axum::routing::post(routes::create_task).put(routes::upload_task))
        .route("/{task_id}", get(routes::get_task).delete(routes::delete_task))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(config: &ApiConfig, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Task API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
