use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod engine;
mod error;
mod jobs;
mod service;

use crate::api::AppState;
use crate::config::ServiceConfig;
use crate::db::Database;
use crate::engine::augmentation::AugmentationRegistry;
use crate::engine::marker::MarkerEngine;
use crate::jobs::{TaskQueue, WorkerPool, WorkerSettings, spawn_ttl_sweeper};
use crate::service::ConversionService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(ServiceConfig::load()?);

    init_logging(config.logging.json);

    info!(
        "Starting conversion service v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&config.storage.data_dir)?;

    // Result store and task queue share one database
    let db_path = config.storage.database_path();
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, /metrics will be empty");
            None
        }
    };

    let augmentation = Arc::new(AugmentationRegistry::resolve(&config.augmentation)?);
    let factory = MarkerEngine::factory(&config.engine, augmentation.clone());

    let queue = Arc::new(TaskQueue::new(
        db.clone(),
        config.jobs.lease_duration(),
        config.jobs.poll_interval(),
    ));

    let service = Arc::new(ConversionService::new(
        config.clone(),
        db.clone(),
        queue.clone(),
        factory.as_ref(),
        augmentation.clone(),
    )?);

    let pool = Arc::new(WorkerPool::start(
        db.clone(),
        queue.clone(),
        factory,
        WorkerSettings::from_config(&config.jobs),
        config.jobs.concurrency,
        config.jobs.resource_units,
    ));

    let shutdown = CancellationToken::new();
    let sweeper = spawn_ttl_sweeper(db.clone(), config.jobs.sweep_interval(), shutdown.clone());

    info!(
        workers = pool.size(),
        max_file_size_mb = config.limits.max_file_size_mb,
        result_ttl_secs = config.jobs.result_ttl_secs,
        max_retries = config.jobs.max_retries,
        soft_time_limit_secs = config.jobs.soft_time_limit_secs,
        hard_time_limit_secs = config.jobs.hard_time_limit_secs,
        engine = %config.engine.command,
        augmentation = %augmentation.describe(),
        "Conversion service configured"
    );

    // Build the router
    let app = api::router(AppState::new(service, Some(pool.clone()), metrics));

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    shutdown.cancel();
    pool.shutdown().await;
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_logging(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conversion_service=info,tower_http=info"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(false))
            .with(filter)
            .init();
    } else {
        let format = fmt::format()
            .with_target(true)
            .with_thread_ids(true)
            .compact();

        tracing_subscriber::registry()
            .with(fmt::layer().event_format(format))
            .with(filter)
            .init();
    }
}
