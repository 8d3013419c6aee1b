use anyhow::{Context, Result};
use clap::Parser;
use kiln_cache::Store;
use kiln_hatchery::provisioner::ProcessProvisioner;
use kiln_hatchery::{Args, Autoscaler, Config, shutdown};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_hatchery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_args(Args::parse());
    config.validate()?;

    info!(
        "Starting Kiln Hatchery {} (orchestrator: {}, max workers: {}, models: {:?})",
        config.name, config.api_url, config.max_workers, config.models
    );

    let store = kiln_cache::open_store(&config.cache_url)
        .await
        .context("Failed to open store")?;
    info!("Store: {}", store.status().await);

    let provisioner = ProcessProvisioner::new(
        config.worker_binary.clone(),
        config.api_url.clone(),
        config.token.clone(),
    );

    let token = shutdown::install_shutdown_handler()?;
    let autoscaler = Autoscaler::new(config, store, Arc::new(provisioner));
    autoscaler.run(token).await;

    info!("Kiln Hatchery stopped");
    Ok(())
}
