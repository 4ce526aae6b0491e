mod config;
mod db;
mod docker;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod transfer;
mod utils;

use crate::config::{AppConfig, Args};
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::db::repository::BackupRepository;
use crate::docker::{ContainerDriver, DockerDriver};
use crate::services::backup_manager::BackupManager;
use crate::services::backup_service::{BackupOps, BackupService};
use crate::services::workspace::WorkspaceManager;
use crate::state::AppState;
use crate::transfer::TransferRegistry;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args)?;

    utils::logger::init(&config.log.level, &config.log.format)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "application is starting");

    // Container runtime must be reachable before anything is scheduled
    let driver = DockerDriver::connect(&config.docker.host, &config.docker.version)?;
    driver.ping().await?;
    let driver: Arc<dyn ContainerDriver> = Arc::new(driver);

    // Database
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = create_pool(
        &config.database.path.to_string_lossy(),
        config.database.max_connections,
    )?;
    migrate(&pool)?;
    let repo = BackupRepository::new(pool.clone());

    // Collaborators, in dependency order
    let workspace = WorkspaceManager::new(&config.mount.temp_directory);
    let transfers = Arc::new(TransferRegistry::from_config(&config.transfer)?);
    let service: Arc<dyn BackupOps> =
        Arc::new(BackupService::new(repo.clone(), driver, workspace, transfers));

    let mut manager = BackupManager::new(config.rules.clone(), service, repo.clone()).await?;
    manager.start().await?;

    // HTTP metrics endpoint
    let state = Arc::new(AppState::new(repo, config.clone()));
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.address).await?;
    tracing::info!(address = %config.server.address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    if let Err(e) = manager.shutdown().await {
        tracing::warn!(error = %e, "scheduler shutdown error");
    }
    db::connection::close_pool(&pool);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
