//! homeci - self-hosted image builds for watched branches
//!
//! ## Commands
//!
//! - `run`: watch every configured branch and build on new commits (default)
//! - `check`: load the config and verify every repository is reachable

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cursor_state::{CommitCursorStore, SurrealCursorStore};
use homeci_core::config::DEFAULT_CONFIG_PATH;
use homeci_core::telemetry::level_from_verbosity;
use homeci_core::{
    Collaborators, ConfigOrganizer, ConfigSnapshot, Engine, Manager, ReloadSummary,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "homeci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-hosted continuous integration for container images", long_about = None)]
struct Cli {
    /// Path to the YAML configuration
    #[arg(short, long, global = true, env = "HOMECI_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Commit cursor database (SurrealKV directory)
    #[arg(long, global = true, env = "HOMECI_STATE", default_value = "homeci.db")]
    state: PathBuf,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch branches and build new commits until interrupted
    Run,

    /// Validate the configuration and check repository access, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    homeci_core::init_tracing(cli.json, level_from_verbosity(cli.verbose));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&cli.config, &cli.state).await,
        Commands::Check => cmd_check(&cli.config).await,
    }
}

async fn cmd_run(config: &Path, state: &Path) -> Result<()> {
    let cursors: Arc<dyn CommitCursorStore> = Arc::new(
        SurrealCursorStore::open(state)
            .await
            .with_context(|| format!("Failed to open cursor store at {}", state.display()))?,
    );

    let mut organizer = ConfigOrganizer::open(Some(config.to_path_buf()))
        .with_context(|| format!("Failed to load config from {}", config.display()))?;

    let engine = Arc::new(Engine::new(Collaborators::production(cursors)));
    let loops = engine
        .run(organizer.current())
        .await
        .context("Failed to start engine")?;
    info!(loops, "homeci running");

    let changed = Arc::new(Notify::new());
    let notifier = Arc::clone(&changed);
    organizer.add_change_listener(move || notifier.notify_one());
    organizer.watch().context("Failed to watch config file")?;

    let snapshots = organizer.subscribe();
    let reload_engine = Arc::clone(&engine);
    let reloads = tokio::spawn(async move {
        loop {
            changed.notified().await;
            let snapshot = Arc::clone(&snapshots.borrow());
            apply_reload(&reload_engine, snapshot).await;
        }
    });

    shutdown_signal().await;
    info!("Shutting down");

    reloads.abort();
    organizer.close();
    engine.close().await;
    Ok(())
}

/// Hand a reloaded snapshot to the engine. On rejection the previous watches
/// keep running and `None` is returned.
async fn apply_reload(engine: &Engine, snapshot: Arc<ConfigSnapshot>) -> Option<ReloadSummary> {
    match engine.reload(snapshot).await {
        Ok(summary) => {
            debug!(?summary, "Reload applied");
            Some(summary)
        }
        Err(e) => {
            debug!(error = %e, "Reload rejected, previous watches kept");
            None
        }
    }
}

async fn cmd_check(config: &Path) -> Result<()> {
    let snapshot = Arc::new(
        ConfigSnapshot::load(config)
            .with_context(|| format!("Failed to load config from {}", config.display()))?,
    );

    // Reachability needs no durable state.
    let cursors: Arc<dyn CommitCursorStore> = Arc::new(
        SurrealCursorStore::in_memory()
            .await
            .context("Failed to open scratch cursor store")?,
    );
    let mut manager = Manager::new(Arc::clone(&snapshot), &Collaborators::production(cursors))
        .context("Failed to build provider client")?;

    if let Err(e) = manager.verify(&CancellationToken::new()).await {
        error!(error = %e, "Repository check failed");
        return Err(e).context("Repository check failed");
    }
    let runners = manager.runners().context("Unsupported repository")?;

    println!(
        "OK: {} repositories reachable, {} with branch pipelines",
        runners.len(),
        snapshot
            .repositories
            .iter()
            .filter(|r| !r.branch_pipelines.is_empty())
            .count()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
