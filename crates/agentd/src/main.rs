mod config;
mod http;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use agentd_core::agent::Agent;
use agentd_core::execution::TokioProcessController;
use agentd_core::models::CoreError;
use agentd_core::persistence::TaskStore;
use agentd_core::registry::TaskRegistry;
use agentd_core::task_context::{ExecutionSettings, TaskContext};
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{AgentConfig, ConfigError};
use crate::http::HttpCoordinator;

#[derive(Parser, Debug)]
#[command(name = "agentd", version, about = "Runs coordinator-assigned scripts on this host")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "agentd.toml")]
    config: PathBuf,

    /// Run a single heartbeat, wait for started tasks, then exit
    #[arg(long)]
    once: bool,

    /// Log filter, overrides RUST_LOG (e.g. `debug`, `agentd_core=trace`)
    #[arg(long)]
    log: Option<String>,
}

#[derive(Debug, Error)]
enum AgentdError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "agentd stopped");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = filter
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<(), AgentdError> {
    let config = AgentConfig::load(&cli.config)?;
    let ident = config.resolve_ident()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agentd-worker")
        .build()?;

    let coordinator = Arc::new(HttpCoordinator::new(
        config.servers(),
        config.request_timeout(),
    )?);

    let context = TaskContext::new(
        TaskStore::new(&config.meta_dir),
        Arc::new(TokioProcessController),
        coordinator.clone(),
        runtime.handle().clone(),
    )
    .with_settings(ExecutionSettings {
        default_timeout: config.default_task_timeout(),
        work_dir: config.work_dir.clone(),
    });

    let mut agent = Agent::new(ident, TaskRegistry::new(Arc::new(context)), coordinator);

    tracing::info!(
        ident = agent.ident(),
        meta_dir = %config.meta_dir.display(),
        servers = ?config.servers(),
        interval_ms = config.interval_ms,
        "agentd started"
    );

    if cli.once {
        let summary = agent.heartbeat()?;
        tracing::info!(
            reported = summary.reported,
            assigned = summary.assigned,
            removed = summary.removed,
            "heartbeat done"
        );
        runtime.block_on(agent.wait_idle(None))?;
        return Ok(());
    }

    loop {
        match agent.heartbeat() {
            Ok(summary) => tracing::debug!(
                reported = summary.reported,
                assigned = summary.assigned,
                removed = summary.removed,
                tasks = agent.registry().len(),
                "heartbeat done"
            ),
            Err(error) => tracing::warn!(%error, "heartbeat failed, retrying next interval"),
        }
        thread::sleep(config.interval());
    }
}
