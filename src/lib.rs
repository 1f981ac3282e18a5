//! taskq: a polling task scheduler that runs untrusted scripts in isolated
//! worker processes.

pub mod api;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod worker;
