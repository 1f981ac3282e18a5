//! Scheduler loop: selects eligible tasks and dispatches one worker each.
//!
//! A pass scans the whole store, applies the eligibility policy, marks each
//! selected task `inprogress`, and launches its worker without waiting for
//! it. The next pass starts one poll interval after the previous one ends,
//! so passes never overlap. Outcomes are reconciled as they arrive and each
//! worker is killed after a grace period.

pub mod reconciler;
pub mod registry;

pub use reconciler::Reconciler;
pub use registry::WorkerRegistry;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::error::{Error, SchedulerError, StoreError};
use crate::store::TaskStore;
use crate::tasks::{Eligibility, Task, TaskStatus, TaskUpdate};
use crate::worker::{LaunchedWorker, OutcomeMessage, ProcessLauncher, WorkerLauncher};

/// Run a scheduler whose workers are `worker` child processes of the
/// current executable, until `shutdown` resolves or a fatal error occurs.
pub async fn run_with_processes<F>(
    config: &Config,
    store: Arc<dyn TaskStore>,
    shutdown: F,
) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let launcher = Arc::new(ProcessLauncher::new(config.sandbox.clone())?);
    Scheduler::new(config.scheduler.clone(), store, launcher)
        .run(shutdown)
        .await?;
    Ok(())
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records read from the store.
    pub scanned: usize,
    /// Tasks dispatched to a worker.
    pub selected: usize,
    /// Tasks passed over (ineligible, already running, or at capacity).
    pub skipped: usize,
    /// Unreadable records and failed status writes or launches.
    pub errors: usize,
}

/// Owns the worker registry and drives dispatch.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    launcher: Arc<dyn WorkerLauncher>,
    registry: WorkerRegistry,
    reconciler: Reconciler,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            reconciler: Reconciler::new(store.clone()),
            store,
            launcher,
            registry: WorkerRegistry::new(),
        }
    }

    /// Live workers, including those inside their teardown grace period.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Run passes until `shutdown` resolves or the store scan fails.
    ///
    /// Every registered worker is terminated before returning.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()>,
    {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_workers = self.config.max_workers,
            "Scheduler started"
        );

        let outcome = self.drive(shutdown).await;
        if let Err(e) = &outcome {
            error!(error = %e, "Scheduler stopping on fatal error");
        }
        self.shutdown().await;
        outcome
    }

    async fn drive<F>(&self, shutdown: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.config.recover_orphans {
            self.recover_orphans().await?;
        }

        loop {
            let report = self.run_cycle().await?;
            debug!(
                scanned = report.scanned,
                selected = report.selected,
                skipped = report.skipped,
                errors = report.errors,
                "Scheduler pass complete"
            );

            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One full pass over the store.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let now = Utc::now();
        let mut report = CycleReport::default();
        let mut records = self.store.iterate();

        while let Some(item) = records.next().await {
            let (id, task) = match item {
                Ok(pair) => pair,
                Err(e @ StoreError::Serialization { .. }) => {
                    warn!(error = %e, "Skipping unreadable task record");
                    report.errors += 1;
                    continue;
                }
                Err(e) => return Err(SchedulerError::Iteration(e)),
            };
            report.scanned += 1;

            let eligibility = Eligibility::of(&task, now);
            if !eligibility.is_eligible() {
                debug!(task_id = %id, reason = %eligibility, "Task not eligible");
                report.skipped += 1;
                continue;
            }

            if self.registry.contains(&id).await {
                debug!(task_id = %id, "Worker still registered, not re-dispatching");
                report.skipped += 1;
                continue;
            }

            if self.registry.len().await >= self.config.max_workers {
                debug!(task_id = %id, max_workers = self.config.max_workers, "Worker limit reached, deferring task");
                report.skipped += 1;
                continue;
            }

            let marked = match self
                .store
                .update(&id, TaskUpdate::status(TaskStatus::InProgress))
                .await
            {
                Ok(marked) => marked,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to mark task in progress, will retry next pass");
                    report.errors += 1;
                    continue;
                }
            };

            match self.dispatch(marked).await {
                Ok(()) => report.selected += 1,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Dispatch failed");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Launch a worker for an already-marked task and wire up its outcome.
    async fn dispatch(&self, task: Task) -> Result<(), SchedulerError> {
        let LaunchedWorker { handle, outcome } = match self.launcher.launch(&task).await {
            Ok(launched) => launched,
            Err(e) => {
                // The task is already `inprogress`; settle it now.
                self.reconciler
                    .reconcile(OutcomeMessage::lost(
                        &task.id,
                        format!("worker launch failed: {e}"),
                    ))
                    .await;
                return Err(e.into());
            }
        };

        info!(task_id = %task.id, name = %task.name, pid = ?handle.pid(), "Dispatched task to worker");
        self.registry.insert(handle).await?;

        let registry = self.registry.clone();
        let reconciler = self.reconciler.clone();
        let grace = self.config.teardown_grace;
        let task_id = task.id;

        tokio::spawn(async move {
            let message = match outcome.await {
                Ok(message) => message,
                Err(_) => OutcomeMessage::lost(&task_id, "outcome channel closed"),
            };
            reconciler.reconcile(message).await;

            tokio::time::sleep(grace).await;
            if let Some(handle) = registry.remove(&task_id).await {
                handle.terminate().await;
                info!(task_id = %task_id, "Worker torn down");
            }
        });

        Ok(())
    }

    /// Fail every task left `inprogress` by a previous run.
    ///
    /// No worker survives a restart, so these can never report. Returns the
    /// number of tasks reconciled.
    pub async fn recover_orphans(&self) -> Result<usize, SchedulerError> {
        let mut orphans = Vec::new();
        let mut records = self.store.iterate();
        while let Some(item) = records.next().await {
            match item {
                Ok((id, task)) if task.status == TaskStatus::InProgress => {
                    if !self.registry.contains(&id).await {
                        orphans.push(id);
                    }
                }
                Ok(_) => {}
                Err(e @ StoreError::Serialization { .. }) => {
                    warn!(error = %e, "Skipping unreadable task record");
                }
                Err(e) => return Err(SchedulerError::Iteration(e)),
            }
        }

        if orphans.is_empty() {
            return Ok(0);
        }

        info!(count = orphans.len(), "Failing tasks orphaned by a previous run");
        for id in &orphans {
            self.reconciler
                .reconcile(OutcomeMessage::lost(
                    id,
                    "scheduler restarted while the task was in progress",
                ))
                .await;
        }
        Ok(orphans.len())
    }

    /// Terminate every registered worker.
    pub async fn shutdown(&self) {
        let count = self.registry.terminate_all().await;
        if count > 0 {
            info!(count, "Terminated workers on shutdown");
        }
    }
}
