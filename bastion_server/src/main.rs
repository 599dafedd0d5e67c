//! Bastion Server - hosts the abuse-mitigation core behind an HTTP pipeline
//!
//! This server handles:
//! - Request gating for every inbound request
//! - Scoring of request traffic and collaborator-reported events
//! - The admin API for the block registry

use bastion_server::abuse::{BlockRepository, MemoryBlockRepository, PgBlockRepository};
use bastion_server::{config, db, routes};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bastion_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Starting Bastion server on {}:{}", config.host, config.port);

    if config.admin_token.is_empty() {
        tracing::warn!("ADMIN_TOKEN is not set, admin API disabled");
    }
    if config.service_token.is_empty() {
        tracing::warn!("SERVICE_TOKEN is not set, event intake disabled");
    }

    let repo: Arc<dyn BlockRepository> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::init_pool(url).await?;
            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;
            Arc::new(PgBlockRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, blocks are kept in memory only");
            Arc::new(MemoryBlockRepository::new())
        }
    };

    let state = routes::AppState::new(config.clone(), repo);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = state.guard.sweeper.clone().spawn(shutdown_rx);

    let app = routes::app(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!("Sweeper task failed: {}", e);
    }
    tracing::info!("Bastion server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
