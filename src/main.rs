//! `zerg`: command-line entry point.
//!
//! Wires a [`ZergConfig`] and a parsed task graph into an [`Orchestrator`]
//! and drives a single run. Reporting/inspection beyond a one-shot status
//! dump is out of scope here; long-running dashboards belong to a separate
//! tool.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use zerg::orchestrator::{build_subprocess_launcher, resolve_launcher_mode, LauncherMode, Orchestrator};
use zerg::{Result, TaskGraph, ZergConfig, ZergError};

#[derive(Parser)]
#[command(name = "zerg", about = "Multi-worker build orchestrator", version)]
struct Cli {
    /// Path to a TOML/JSON/YAML configuration file. Falls back to defaults
    /// when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root of the git repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drives a task graph to completion.
    Start {
        /// Path to the task graph document.
        #[arg(long)]
        task_graph: PathBuf,

        /// Feature branch name; defaults to the task graph's own `feature`.
        #[arg(long)]
        feature: Option<String>,

        /// Number of workers to run concurrently.
        #[arg(long)]
        workers: Option<u32>,

        /// Level to start from; defaults to resuming from saved state.
        #[arg(long)]
        start_level: Option<u32>,

        /// Compute the run plan and exit without spawning workers.
        #[arg(long)]
        dry_run: bool,

        /// Launcher backend: subprocess, container, or auto.
        #[arg(long, default_value = "auto")]
        launcher: String,
    },

    /// Prints the current run status for a feature.
    Status {
        /// Feature branch name.
        feature: String,
    },

    /// Clears the paused/error state and allows the run to proceed.
    Resume {
        /// Feature branch name.
        feature: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<ZergConfig> {
    match path {
        Some(path) => ZergConfig::from_path(path),
        None => Ok(ZergConfig::default()),
    }
}

async fn build_launcher(
    mode: &str,
    repo: &std::path::Path,
    config: &ZergConfig,
    log_dir: PathBuf,
) -> Result<Arc<dyn zerg::launcher::WorkerLauncher>> {
    match resolve_launcher_mode(mode, repo).await? {
        LauncherMode::Subprocess => {
            let worker_bin = std::env::current_exe().map_err(ZergError::Io)?;
            Ok(build_subprocess_launcher(worker_bin, Some(log_dir)))
        }
        LauncherMode::Container => {
            #[cfg(feature = "container")]
            {
                let launcher = zerg::launcher::container::ContainerLauncher::new(
                    config.container.clone(),
                    config.security.clone(),
                    None,
                    "zerg-worker".to_string(),
                    "entrypoint.sh".to_string(),
                )
                .await?;
                Ok(Arc::new(launcher))
            }
            #[cfg(not(feature = "container"))]
            {
                let _ = (config, log_dir);
                Err(ZergError::config(
                    "container launcher mode requested but the `container` feature is not compiled in",
                ))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Start { task_graph, feature, workers, start_level, dry_run, launcher } => {
            let graph = TaskGraph::parse_file(&task_graph)?;
            let feature = feature.unwrap_or_else(|| graph.feature.clone());
            let worker_count = workers.unwrap_or(config.workers.default_count as u32);

            let state_dir = cli.repo.join(".zerg").join("state");
            let log_dir = cli.repo.join(".zerg").join("logs");
            let spec_dir = cli.repo.clone();

            let launcher = build_launcher(&launcher, &cli.repo, &config, log_dir.clone()).await?;

            let orchestrator = Orchestrator::new(
                feature,
                config,
                graph,
                cli.repo.clone(),
                state_dir,
                spec_dir,
                log_dir,
                launcher,
            );

            orchestrator.start(worker_count, start_level, dry_run).await?;
            let status = orchestrator.status().await?;
            println!("{}", serde_json::to_string_pretty(&status_json(&status))?);
        }
        Command::Status { feature } => {
            let state_dir = cli.repo.join(".zerg").join("state");
            let store = zerg::state::StateStore::new(&state_dir, &feature);
            let state = store.load().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Resume { feature } => {
            let state_dir = cli.repo.join(".zerg").join("state");
            let store = zerg::state::StateStore::new(&state_dir, &feature);
            store.set_paused(false).await?;
            store.set_error(None).await?;
            println!("resumed run for feature '{feature}'");
        }
    }

    Ok(())
}

fn status_json(status: &zerg::orchestrator::OrchestratorStatus) -> serde_json::Value {
    serde_json::json!({
        "feature": status.feature,
        "running": status.running,
        "paused": status.paused,
        "current_level": status.current_level,
        "is_complete": status.is_complete,
        "progress": {
            "total": status.progress.total,
            "completed": status.progress.completed,
            "failed": status.progress.failed,
            "percent": status.progress.percent,
        },
    })
}
