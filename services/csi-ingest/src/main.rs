use anyhow::{Context, Result};
use csi_ingest::api::{start_api_server, AppState};
use csi_ingest::{Config, Ingestor, LocalStore, PgRecordStore, RemotePersister, S3BlobStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        "Starting CSI ingest service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize remote stores
    let record_store = PgRecordStore::new(&config.database)
        .await
        .context("Failed to initialize record store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = S3BlobStore::new(&config.s3)
        .await
        .context("Failed to initialize S3 blob store")?;

    blob_store
        .check_bucket()
        .await
        .context("Failed to verify S3 bucket")?;

    tokio::fs::create_dir_all(&config.local.spool_dir)
        .await
        .with_context(|| format!("Failed to create spool directory {:?}", config.local.spool_dir))?;

    let remote = RemotePersister::new(
        Arc::new(blob_store),
        Arc::new(record_store),
        &config.ingest,
    );

    let ingestor = Ingestor::new(
        LocalStore::new(&config.local),
        remote,
        config.s3.key_prefix.clone(),
        config.ingest.max_concurrent_ingests,
    );

    let state = AppState {
        ingestor: Arc::new(ingestor),
        spool_dir: config.local.spool_dir.clone(),
        max_file_size: config.ingest.max_file_size_bytes,
    };

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Ingest service stopped");

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
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, draining in-flight requests");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, draining in-flight requests");
        }
    }
}
