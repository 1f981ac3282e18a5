//! Worker units run one task attempt in isolation.
//!
//! The parent side ([`process`]) launches and supervises child processes;
//! the child side ([`runner`]) evaluates the payload in a [`sandbox`] and
//! reports one [`protocol::OutcomeMessage`].

pub mod paths;
pub mod process;
pub mod protocol;
pub mod runner;
pub mod sandbox;

pub use process::{LaunchedWorker, ProcessLauncher, WorkerControl, WorkerHandle, WorkerLauncher};
pub use protocol::{FailureKind, Outcome, OutcomeMessage, TaskFailure};
pub use runner::run_worker;
pub use sandbox::{Capability, Sandbox};
