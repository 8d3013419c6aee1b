use anyhow::Context;
use kiln_orchestrator::{api, config::Config, db, service::dispatcher, shutdown, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_orchestrator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kiln Orchestrator...");

    let config = Config::from_env()?;
    config.validate()?;

    let store = kiln_cache::open_store(&config.cache_url)
        .await
        .context("Failed to open store")?;
    tracing::info!("Store: {}", store.status().await);

    let state = match config.database_url.clone() {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(&database_url)
                .await
                .context("Failed to create database pool")?;

            tracing::info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            AppState::postgres(pool, store, config)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs and workers are kept in memory");
            AppState::in_memory(store, config)
        }
    };

    let token = shutdown::install_shutdown_handler()?;

    let dispatcher = tokio::spawn(dispatcher::run_dispatcher(state.clone(), token.clone()));
    let requirements = tokio::spawn(dispatcher::run_requirement_cache(
        state.clone(),
        token.clone(),
    ));

    // Build router with all API endpoints
    let addr = state.config.bind_addr.clone();
    let app = api::create_router(state);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await
        .context("Server error")?;

    token.cancel();
    let _ = tokio::join!(dispatcher, requirements);

    tracing::info!("Kiln Orchestrator stopped");
    Ok(())
}
