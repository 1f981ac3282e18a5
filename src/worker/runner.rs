//! Worker entry point, the child side of a dispatch.
//!
//! Reads one JSON `Task` line, runs its payload in a [`Sandbox`] on a
//! dedicated thread raced against the wall-clock bound, and writes exactly
//! one [`OutcomeMessage`] line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, WorkerError};
use crate::tasks::{Task, TaskType};
use crate::worker::paths::resolve_data_path;
use crate::worker::protocol::{FailureKind, Outcome, OutcomeMessage, TaskFailure};
use crate::worker::sandbox::{Capability, Sandbox};

/// Load the program text for `task`.
pub fn read_payload(task: &Task, config: &SandboxConfig) -> Result<String, SandboxError> {
    match task.task_type {
        TaskType::Code => Ok(task.input.clone()),
        TaskType::File => {
            let path = resolve_data_path(&config.data_dir, &task.input)?;
            std::fs::read_to_string(&path).map_err(|e| SandboxError::PayloadRead {
                path,
                message: e.to_string(),
            })
        }
    }
}

/// Run one attempt of `task` and produce its outcome. Never fails.
pub async fn execute(task: &Task, config: &SandboxConfig) -> Outcome {
    let source = match read_payload(task, config) {
        Ok(source) => source,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Could not load payload");
            return Outcome::Failure {
                error: TaskFailure::from(&e),
                partial: None,
            };
        }
    };

    let sandbox =
        Sandbox::new(config.clone()).with_capabilities(Capability::for_task(task.task_type));
    let (tx, rx) = oneshot::channel();

    // The engine is synchronous; a runaway payload must not hold the runtime.
    let spawned = std::thread::Builder::new()
        .name("sandbox".to_string())
        .spawn(move || {
            let _ = tx.send(sandbox.evaluate(&source));
        });
    if let Err(e) = spawned {
        return Outcome::failure(
            FailureKind::Execution,
            format!("could not start sandbox thread: {e}"),
        );
    }

    match tokio::time::timeout(config.timeout, rx).await {
        Ok(Ok(evaluation)) => evaluation.into_outcome(),
        Ok(Err(_)) => Outcome::failure(
            FailureKind::Execution,
            "sandbox thread ended without a result",
        ),
        Err(_) => Outcome::Failure {
            error: TaskFailure::from(&SandboxError::Timeout {
                after: config.timeout,
            }),
            partial: None,
        },
    }
}

/// Serve a single dispatch over the given streams.
pub async fn run_worker<R, W>(
    config: &SandboxConfig,
    input: R,
    mut output: W,
) -> Result<OutcomeMessage, WorkerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| WorkerError::Protocol("no dispatch message on stdin".to_string()))?;

    let task: Task = serde_json::from_str(&line)
        .map_err(|e| WorkerError::Protocol(format!("malformed dispatch message: {e}")))?;

    info!(task_id = %task.id, task_type = ?task.task_type, "Worker executing task");
    let outcome = execute(&task, config).await;
    info!(task_id = %task.id, success = outcome.is_success(), "Worker finished task");

    let message = OutcomeMessage::new(task.id, outcome);
    let mut encoded = serde_json::to_string(&message)?;
    encoded.push('\n');
    output.write_all(encoded.as_bytes()).await?;
    output.flush().await?;

    Ok(message)
}
