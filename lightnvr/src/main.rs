//! LightNVR: a lightweight network video recorder.
//!
//! Ingests RTSP camera feeds and maintains a continuous archive of
//! fixed-duration MP4 segments indexed in a local SQLite catalog.

mod config;
mod retention;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use recording_catalog::Catalog;
use shutdown_coordinator::ShutdownCoordinator;
use tracing::{info, warn};

use crate::config::Config;
use crate::retention::RetentionSettings;
use crate::supervisor::Supervisor;

/// Deadline for the whole process to reach quiescence after a signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "lightnvr")]
#[command(version, about = "Lightweight network video recorder")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/lightnvr/lightnvr.toml")]
    config: PathBuf,

    /// Override the storage path from the config file
    #[arg(long)]
    storage_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(path) = cli.storage_path {
        config.storage_path = path;
    }

    std::fs::create_dir_all(&config.storage_path).with_context(|| {
        format!(
            "failed to create storage directory {}",
            config.storage_path.display()
        )
    })?;
    let storage_root = std::fs::canonicalize(&config.storage_path)?;
    info!(storage = %storage_root.display(), streams = config.streams.len(), "starting");

    let catalog = Arc::new(
        Catalog::open_at(&config.db_path(&storage_root)).context("failed to open catalog")?,
    );
    let coordinator = ShutdownCoordinator::new();

    // RTSP I/O is asynchronous under the hood; the recorder threads block
    // on this runtime per read.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let mut supervisor = Supervisor::new(
        Arc::clone(&catalog),
        Arc::clone(&coordinator),
        runtime.handle().clone(),
    );
    supervisor
        .seed_catalog(&config, &storage_root)
        .context("failed to seed stream configurations")?;
    supervisor.recover_catalog();
    supervisor.start();

    let sweeper = retention::spawn_sweeper(
        Arc::clone(&catalog),
        Arc::clone(&coordinator),
        storage_root.clone(),
        RetentionSettings {
            max_storage_bytes: config.max_storage_bytes(),
            retention_days: config.retention_days,
            auto_delete_oldest: config.auto_delete_oldest,
            interval: Duration::from_secs(config.retention_check_interval_secs),
        },
    )
    .context("failed to start retention sweeper")?;

    let watch = std::thread::Builder::new()
        .name("supervisor".to_string())
        .spawn(move || {
            supervisor.run();
            supervisor.shutdown();
        })
        .context("failed to start supervisor thread")?;

    runtime.block_on(wait_for_signal())?;
    coordinator.initiate_shutdown();

    if watch.join().is_err() {
        warn!("supervisor thread panicked during shutdown");
    }
    if sweeper.join().is_err() {
        warn!("retention thread panicked during shutdown");
    }
    if !coordinator.wait_for_quiescence(SHUTDOWN_DEADLINE) {
        warn!("some components did not stop before the deadline");
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for ctrl-c")?;
            info!("received SIGINT");
        }
        _ = terminate.recv() => {
            info!("received SIGTERM");
        }
    }
    Ok(())
}
