use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use taskq::api::{self, ApiState};
use taskq::config::{Config, SandboxConfig};
use taskq::scheduler;
use taskq::store::{LibSqlTaskStore, TaskStore};
use taskq::worker::run_worker;

#[derive(Parser)]
#[command(name = "taskq", version, about = "Run submitted scripts as retried, sandboxed tasks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the scheduler together (default).
    Serve,
    /// Run only the scheduler loop.
    Scheduler,
    /// Run only the HTTP API.
    Api,
    /// Execute one dispatched task read from stdin.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct WorkerArgs {
    /// Wall-clock bound for the payload.
    #[arg(long, env = "TASKQ_EXEC_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,
    /// Directory `file` inputs resolve in.
    #[arg(long, env = "TASKQ_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Engine operation budget.
    #[arg(long, env = "TASKQ_MAX_OPERATIONS", default_value_t = 50_000_000)]
    max_operations: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    // Worker stdout carries the outcome message, so its logs go to stderr.
    init_tracing(matches!(command, Command::Worker(_)));

    match command {
        Command::Worker(args) => run_worker_command(args).await,
        Command::Serve => run_services(true, true).await,
        Command::Scheduler => run_services(true, false).await,
        Command::Api => run_services(false, true).await,
    }
}

fn init_tracing(to_stderr: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false);

    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let sandbox = SandboxConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        data_dir: args.data_dir,
        max_operations: args.max_operations,
        ..SandboxConfig::default()
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_worker(&sandbox, stdin, tokio::io::stdout())
        .await
        .context("worker failed")?;
    Ok(())
}

async fn open_store(path: &Path) -> anyhow::Result<Arc<dyn TaskStore>> {
    let store = if path == Path::new(":memory:") {
        LibSqlTaskStore::new_memory().await
    } else {
        LibSqlTaskStore::new_local(path).await
    }
    .with_context(|| format!("opening task store at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn run_services(with_scheduler: bool, with_api: bool) -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    let store = open_store(&config.db_path).await?;

    eprintln!("taskq v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {}", config.db_path.display());
    eprintln!("   Data:  {}", config.sandbox.data_dir.display());
    if with_api {
        eprintln!("   API:   http://{}:{}/", config.api.host, config.api.port);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    {
        let stop_tx = Arc::clone(&stop_tx);
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            stop_tx.send_replace(true);
        });
    }

    // Whichever side stops first takes the other down with it.
    let scheduler_task = async {
        if with_scheduler {
            let result = run_scheduler(&config, store.clone(), stop_rx.clone()).await;
            stop_tx.send_replace(true);
            result
        } else {
            Ok(())
        }
    };
    let api_task = async {
        if with_api {
            let result = run_api(&config, store.clone(), stop_rx.clone()).await;
            stop_tx.send_replace(true);
            result
        } else {
            Ok(())
        }
    };

    let (scheduler_result, api_result) = tokio::join!(scheduler_task, api_task);
    scheduler_result?;
    api_result?;

    tracing::info!("taskq stopped");
    Ok(())
}

async fn run_scheduler(
    config: &Config,
    store: Arc<dyn TaskStore>,
    stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    scheduler::run_with_processes(config, store, stopped(stop_rx))
        .await
        .context("scheduler stopped")
}

async fn run_api(
    config: &Config,
    store: Arc<dyn TaskStore>,
    stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let state = ApiState::new(store, &config.api, &config.sandbox);
    api::serve(&config.api, state, stopped(stop_rx))
        .await
        .context("HTTP API failed")
}

/// Resolves once shutdown has been requested.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
