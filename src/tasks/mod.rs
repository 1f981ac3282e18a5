//! Task records and the eligibility policy that decides when they run.

pub mod model;
pub mod policy;

pub use model::{NewTask, Task, TaskStatus, TaskType, TaskUpdate};
pub use policy::{Eligibility, RETRY_BACKOFF, should_process};
