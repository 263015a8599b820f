use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use video_upload_service::api::{start_api_server, AppState};
use video_upload_service::{
    Config, FfmpegToolkit, ObjectPublisher, PgVideoStore, ReferenceResolver, S3Store,
    StagingStore, UploadPipeline, UploadReceiver,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting video upload service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let videos = Arc::new(
        PgVideoStore::new(&config.database)
            .await
            .context("Failed to initialize video store")?,
    );

    if config.database.run_migrations {
        videos
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let store = Arc::new(S3Store::new(&config.s3).await);
    let toolkit = Arc::new(FfmpegToolkit::new(&config.tools));

    let staging_dir = config.staging_dir();
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .with_context(|| format!("Failed to create staging dir {}", staging_dir.display()))?;

    let pipeline = Arc::new(UploadPipeline::new(
        UploadReceiver::from_config(&config.upload)?,
        StagingStore::new(staging_dir),
        toolkit,
        ObjectPublisher::new(store.clone(), config.s3.bucket.clone()),
        videos.clone(),
    ));

    let state = AppState {
        pipeline,
        resolver: ReferenceResolver::new(store, config.presigned_url_expiry()),
        videos,
    };

    let shutdown = CancellationToken::new();

    let api_config = config.api.clone();
    let max_upload_bytes = config.upload.max_upload_bytes;
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config, max_upload_bytes, api_shutdown).await
        {
            error!(error = %e, "API server error");
        }
    });

    info!("Upload service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down upload service");

    shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Upload service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
