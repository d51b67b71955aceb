//! Parking occupancy detector service.
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml)
//! 2. Environment variables (prefixed with DETECTOR_)

use anyhow::Context;
use parkwatch_detector::api::{self, AppState};
use parkwatch_detector::config::DetectorConfig;
use parkwatch_detector::telemetry;
use parkwatch_detector::{
    BackendSink, DefaultSourceFactory, HttpBackendSink, Scheduler, SnapshotProvider, SourceFactory,
    SyncClient,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    telemetry::init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.backend.url,
        max_workers = config.scheduler.max_workers,
        "Starting parking occupancy detector"
    );

    config.validate()?;

    telemetry::init_metrics(config.service.metrics_port)?;

    let factory: Arc<dyn SourceFactory> = Arc::new(
        DefaultSourceFactory::from_config(&config.feed)
            .context("Failed to build feed HTTP client")?,
    );
    let scheduler = Arc::new(Scheduler::new(&config, factory));

    let sink: Arc<dyn BackendSink> =
        Arc::new(HttpBackendSink::new(&config.backend).context("Failed to build backend client")?);
    let provider: Arc<dyn SnapshotProvider> = scheduler.clone();
    let sync = SyncClient::new(provider, sink, config.backend.sync_interval());

    let shutdown = CancellationToken::new();

    let sync_handle = tokio::spawn(sync.run(shutdown.child_token()));

    let state = AppState {
        scheduler: scheduler.clone(),
        service_name: config.service.name.clone(),
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown.child_token();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(state, &api_config, api_shutdown).await {
            error!(error = %e, "API server failed");
        }
    });

    shutdown_signal().await;

    info!("Shutting down parking occupancy detector");
    shutdown.cancel();

    scheduler.shutdown().await;

    if let Err(e) = sync_handle.await {
        warn!(error = %e, "Sync task ended abnormally");
    }
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API task ended abnormally");
    }

    info!("Parking occupancy detector stopped");
    Ok(())
}

/// Load configuration, falling back to environment variables only.
fn load_config() -> anyhow::Result<DetectorConfig> {
    let config = DetectorConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({e}), trying environment");
        DetectorConfig::from_env()
    })?;

    Ok(config)
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
