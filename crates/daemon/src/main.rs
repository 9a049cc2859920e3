//! CyberLab Daemon
//!
//! Serves the lab lifecycle API and keeps managed labs healthy.

use clap::Parser;
use cyberlab_common::Database;
use cyberlab_daemon::compose::ComposeCli;
use cyberlab_daemon::config::DaemonConfig;
use cyberlab_daemon::controller::{ControllerOptions, LabController};
use cyberlab_daemon::runtime::CliRuntime;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cyberlabd")]
#[command(about = "CyberLab daemon - lifecycle control for container-based cyber labs")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.cyberlab/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory that relative compose paths resolve against
    #[arg(long)]
    labs_root: Option<PathBuf>,

    /// Restart labs whose containers die (also `AUTO_RECOVERY=true`)
    #[arg(long)]
    auto_recovery: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("CyberLab daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, then let flags override it
    let config_path = cyberlab_common::expand_home(&cli.config);
    let mut config = DaemonConfig::load(&config_path)?;
    config.apply_env();
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(labs_root) = cli.labs_root {
        config.labs_root = labs_root;
    }
    if cli.auto_recovery {
        config.controller.auto_recovery = true;
    }
    config.validate()?;

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;

    let db = Database::open(config.db_path())?;
    if config.seed_default_labs {
        let seeded = db.seed_default_labs()?;
        info!("Lab catalog ready ({} stock labs)", seeded.len());
    }

    let runtime = Arc::new(CliRuntime::new(
        config.runtime.binary.clone(),
        Duration::from_secs(config.runtime.command_timeout_secs),
    ));
    let compose = Arc::new(ComposeCli::new(config.compose.clone(), runtime.clone()));
    let controller = Arc::new(LabController::new(
        Arc::new(db),
        runtime,
        compose,
        ControllerOptions::from_config(&config),
    ));

    // Anything the registry still shows as up was left by a previous process
    let stale = controller.reconcile_registry()?;
    if !stale.is_empty() {
        warn!("Marked {} labs from a previous run as error", stale.len());
    }

    let overview = controller.runtime_overview().await;
    if !overview.available {
        warn!("Container runtime is not reachable; labs cannot start until it is");
    }

    let sweep = controller.spawn_health_sweep();

    let addr: SocketAddr = config.listen.parse()?;
    let server_handle = tokio::spawn(cyberlab_daemon::api::serve(addr, controller.clone()));

    info!("Daemon started on http://{}", addr);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    sweep.shutdown().await;

    let timeout = config.controller.shutdown_timeout();
    match tokio::time::timeout(timeout, controller.stop_all_labs()).await {
        Ok(results) => {
            for (lab_id, result) in results {
                if let Err(e) = result {
                    warn!("Failed to stop lab {} during shutdown: {}", lab_id, e);
                }
            }
        }
        Err(_) => warn!("Gave up stopping labs after {:?}", timeout),
    }

    info!("Daemon shutdown complete");
    Ok(())
}
