mod config;
mod courier;
mod delivery;
mod fetch;
mod logging;
mod queue;
mod request;
mod router;
mod sweep;
mod util;

use std::str::FromStr;
use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use courier::OutboxCourier;
use fetch::ProcessRegistry;
use queue::JobQueueManager;
use router::{AppState, create_router};
use sweep::Sweeper;

fn create_dir(path: &std::path::Path) -> color_eyre::Result<()> {
    if path.exists() {
        tracing::info!("Directory '{}' already exists, skipping...", path.display());
    } else {
        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("Failed to create directory {}", path.display()))?;
        tracing::info!("Directory '{}' does not exist, creating...", path.display());
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let config = config::config();
    let _log_guard = logging::init(&config.log_dir)?;

    create_dir(&config.download_dir)?;
    create_dir(&config.delivery.outbox_dir)?;

    let settings = config.queue_settings();
    tracing::info!(
        busy_policy = ?settings.busy_policy,
        aria2c = %settings.aria2.program.display(),
        max_part_size = settings.delivery.max_part_size,
        "Starting torrent courier"
    );

    let registry = Arc::new(ProcessRegistry::new());
    let courier = Arc::new(OutboxCourier::new(
        config.delivery.outbox_dir.clone(),
        config.delivery.max_part_size,
    ));
    let manager = JobQueueManager::new(courier.clone(), registry.clone(), settings)?;

    let shutdown = CancellationToken::new();

    let schedule = Schedule::from_str(&config.sweep.sweep_schedule)
        .wrap_err("Invalid sweep schedule")?;
    let sweeper = Sweeper::new(
        manager.clone(),
        courier.clone(),
        config.download_dir.clone(),
        config.retention(),
    );
    let sweep_task = tokio::spawn(sweeper.run(schedule, shutdown.clone()));

    let app = create_router(AppState {
        manager: manager.clone(),
        courier,
        download_dir: config.download_dir.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.host)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.host))?;
    tracing::info!("Listening on: {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server only returns on shutdown; make sure nothing keeps running
    shutdown.cancel();
    manager.shutdown().await;
    if let Some(job) = registry.current() {
        tracing::warn!(job = %job, "Fetch process was still registered at shutdown");
        registry.terminate_current();
    }
    let _ = sweep_task.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
