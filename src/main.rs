use std::net::SocketAddr;

use anyhow::Context;
use anyhow::Result;
use mlm_ledger::{AppState, Config, init_pool, init_router, run_migrations, scheduler};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let settings = config.settings().context("Invalid commission settings")?;

    let pool = init_pool(&config).await?;
    run_migrations(&pool).await?;

    let worker = scheduler::spawn_payout_worker(
        pool.clone(),
        config.payout_interval(),
        settings.payout_batch_size,
    );

    let app = init_router(AppState::new(pool, settings));

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    worker.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutting down");
}
