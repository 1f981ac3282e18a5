//! Parent-side worker supervision.
//!
//! A [`WorkerLauncher`] turns a task into a live worker plus a channel that
//! yields exactly one [`OutcomeMessage`]. [`ProcessLauncher`] does this by
//! spawning `taskq worker` as a child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::WorkerError;
use crate::tasks::Task;
use crate::worker::protocol::{FailureKind, Outcome, OutcomeMessage};

/// Extra time the parent waits past the sandbox bound before giving up.
pub const OUTCOME_SLACK: Duration = Duration::from_secs(2);

/// Control over one running worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// OS process id, when there is one.
    fn pid(&self) -> Option<u32>;

    /// Kill the worker and reap it. Safe to call after it has exited.
    async fn terminate(&mut self);
}

/// Registry entry for a live worker.
pub struct WorkerHandle {
    pub task_id: String,
    control: Box<dyn WorkerControl>,
}

impl WorkerHandle {
    pub fn new(task_id: impl Into<String>, control: Box<dyn WorkerControl>) -> Self {
        Self {
            task_id: task_id.into(),
            control,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub async fn terminate(mut self) {
        self.control.terminate().await;
        debug!(task_id = %self.task_id, "Worker terminated");
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("task_id", &self.task_id)
            .field("pid", &self.pid())
            .finish()
    }
}

/// A freshly dispatched worker.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub handle: WorkerHandle,
    /// Resolves exactly once with the worker's outcome.
    pub outcome: oneshot::Receiver<OutcomeMessage>,
}

/// Starts isolated workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, task: &Task) -> Result<LaunchedWorker, WorkerError>;
}

/// Launches each task in its own `taskq worker` child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    sandbox: SandboxConfig,
}

impl ProcessLauncher {
    /// Launch workers from the running executable.
    pub fn new(sandbox: SandboxConfig) -> Result<Self, WorkerError> {
        let program = std::env::current_exe()?;
        Ok(Self::with_program(program, sandbox))
    }

    /// Launch workers from a specific binary.
    pub fn with_program(program: impl Into<PathBuf>, sandbox: SandboxConfig) -> Self {
        Self {
            program: program.into(),
            sandbox,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--timeout-ms")
            .arg(self.sandbox.timeout.as_millis().to_string())
            .arg("--data-dir")
            .arg(&self.sandbox.data_dir)
            .arg("--max-operations")
            .arg(self.sandbox.max_operations.to_string())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Ok(filter) = std::env::var("RUST_LOG") {
            command.env("RUST_LOG", filter);
        }
        command
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, task: &Task) -> Result<LaunchedWorker, WorkerError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed {
                task_id: task.id.clone(),
                reason: e.to_string(),
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                return Err(WorkerError::SpawnFailed {
                    task_id: task.id.clone(),
                    reason: "worker stdio was not captured".to_string(),
                });
            }
        };

        let mut dispatch = serde_json::to_string(task)?;
        dispatch.push('\n');

        let (tx, rx) = oneshot::channel();
        let task_id = task.id.clone();
        let deadline = self.sandbox.timeout + OUTCOME_SLACK;

        tokio::spawn(async move {
            let mut stdin = stdin;
            if let Err(e) = stdin.write_all(dispatch.as_bytes()).await {
                warn!(task_id = %task_id, error = %e, "Failed to send dispatch message");
            }
            drop(stdin);

            let mut lines = BufReader::new(stdout).lines();
            let message = match tokio::time::timeout(deadline, lines.next_line()).await {
                Ok(Ok(Some(line))) => parse_outcome(&task_id, &line),
                Ok(Ok(None)) => {
                    OutcomeMessage::lost(&task_id, "worker exited without reporting an outcome")
                }
                Ok(Err(e)) => {
                    OutcomeMessage::lost(&task_id, format!("failed to read worker output: {e}"))
                }
                Err(_) => OutcomeMessage::new(
                    &task_id,
                    Outcome::failure(
                        FailureKind::Timeout,
                        format!("no outcome from worker within {deadline:?}"),
                    ),
                ),
            };
            let _ = tx.send(message);
        });

        debug!(task_id = %task.id, pid = ?child.id(), "Worker process spawned");
        Ok(LaunchedWorker {
            handle: WorkerHandle::new(&task.id, Box::new(ProcessControl { child })),
            outcome: rx,
        })
    }
}

/// Decode an outcome line, substituting a lost-worker failure for anything
/// unusable.
fn parse_outcome(task_id: &str, line: &str) -> OutcomeMessage {
    match serde_json::from_str::<OutcomeMessage>(line) {
        Ok(message) if message.id == task_id => message,
        Ok(message) => OutcomeMessage::lost(
            task_id,
            format!("worker reported for unexpected task {}", message.id),
        ),
        Err(e) => OutcomeMessage::lost(task_id, format!("unreadable outcome message: {e}")),
    }
}

struct ProcessControl {
    child: Child,
}

#[async_trait]
impl WorkerControl for ProcessControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Worker kill failed (already exited?)");
        }
    }
}
