use anyhow::Result;
use clap::Parser;
use kiln_worker::executor::ShellStepRunner;
use kiln_worker::{Agent, Args, Config, shutdown};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_args(Args::parse());
    config.validate()?;

    info!(
        "Starting Kiln Worker {} (orchestrator: {}, ttl: {:?}, single use: {})",
        config.name, config.api_url, config.ttl, config.single_use
    );
    if let Some(job_id) = config.booked_job_id {
        info!("Booked job: {}", job_id);
    }

    let token = shutdown::install_shutdown_handler()?;
    let agent = Agent::new(config, Arc::new(ShellStepRunner));

    let reason = agent.run(token).await;
    info!("Kiln Worker exiting: {:?}", reason);

    Ok(())
}
