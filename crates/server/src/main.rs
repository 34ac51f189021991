//! quarryd: one node of the Quarry distributed content cache.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use quarry_core::config::AppConfig;
use quarry_core::{Clock, SystemClock};
use quarry_server::{AppState, ClusterServices};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Quarry - distributed content cache node
#[derive(Parser, Debug)]
#[command(name = "quarryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "QUARRY_CONFIG",
        default_value = "config/quarryd.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file, then `QUARRY_` variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("QUARRY_").ignore(&["config"]).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quarry v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    quarry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let store = quarry_storage::from_config(&config.storage)
        .await
        .context("failed to initialize location storage")?;
    store
        .health_check()
        .await
        .context("location storage health check failed")?;
    tracing::info!(backend = store.backend_name(), "Location storage initialized");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = ClusterServices::in_process(store.clone(), clock.clone(), &config);
    let state = AppState::build(config, clock, store, services)
        .await
        .context("failed to initialize node")?;

    let cancel = CancellationToken::new();
    let tasks = state
        .start(&cancel)
        .await
        .context("failed to start node")?;
    tracing::info!(
        machine_id = %state.machine_id,
        location = %state.location,
        "Node running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task failed");
        }
    }
    state.shutdown().await.context("shutdown failed")?;
    tracing::info!("Node stopped");
    Ok(())
}
