//! Configuration types.
//!
//! Everything is read from `TASKQ_*` environment variables; unset variables
//! fall back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between the end of one pass and the start of the next.
    pub poll_interval: Duration,
    /// Delay between receiving a worker's outcome and killing its process.
    pub teardown_grace: Duration,
    /// Maximum number of live worker processes.
    pub max_workers: usize,
    /// Reconcile tasks left `inprogress` by a previous scheduler run.
    pub recover_orphans: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            teardown_grace: Duration::from_secs(5),
            max_workers: 16,
            recover_orphans: true,
        }
    }
}

/// Limits applied to every sandboxed evaluation.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock bound for one attempt.
    pub timeout: Duration,
    /// Directory that `file` task inputs are resolved against.
    pub data_dir: PathBuf,
    /// Engine operation budget per attempt.
    pub max_operations: u64,
    /// Maximum function call nesting.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth.
    pub max_expr_depth: usize,
    /// Maximum string length in bytes.
    pub max_string_size: usize,
    /// Maximum array length.
    pub max_array_size: usize,
    /// Maximum object map size.
    pub max_map_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            data_dir: PathBuf::from("./data"),
            max_operations: 50_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 10_000,
        }
    }
}

/// HTTP front end configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted script upload.
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_upload_bytes: 64 * 1024,
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// libSQL database file, or `:memory:`.
    pub db_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./db/db.sqlite"),
            scheduler: SchedulerConfig::default(),
            sandbox: SandboxConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("TASKQ_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "TASKQ_POLL_INTERVAL_MS",
                duration_ms(defaults.scheduler.poll_interval),
            )?),
            teardown_grace: Duration::from_millis(parse_or(
                &lookup,
                "TASKQ_TEARDOWN_GRACE_MS",
                duration_ms(defaults.scheduler.teardown_grace),
            )?),
            max_workers: parse_or(&lookup, "TASKQ_MAX_WORKERS", defaults.scheduler.max_workers)?,
            recover_orphans: parse_or(
                &lookup,
                "TASKQ_RECOVER_ORPHANS",
                defaults.scheduler.recover_orphans,
            )?,
        };

        if scheduler.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKQ_MAX_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let sandbox = SandboxConfig {
            timeout: Duration::from_millis(parse_or(
                &lookup,
                "TASKQ_EXEC_TIMEOUT_MS",
                duration_ms(defaults.sandbox.timeout),
            )?),
            data_dir: lookup("TASKQ_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox.data_dir),
            max_operations: parse_or(
                &lookup,
                "TASKQ_MAX_OPERATIONS",
                defaults.sandbox.max_operations,
            )?,
            ..defaults.sandbox
        };

        let api = ApiConfig {
            host: lookup("TASKQ_API_HOST").unwrap_or(defaults.api.host),
            port: parse_or(&lookup, "TASKQ_API_PORT", defaults.api.port)?,
            max_upload_bytes: parse_or(
                &lookup,
                "TASKQ_MAX_UPLOAD_BYTES",
                defaults.api.max_upload_bytes,
            )?,
        };

        Ok(Self {
            db_path,
            scheduler,
            sandbox,
            api,
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Parse `key` if present, otherwise return `default`.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e} (got {raw:?})"),
            }),
        None => Ok(default),
    }
}
