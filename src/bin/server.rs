use anyhow::Context;
use dvr_ingest::api::{create_api_server, AppState, IngestSettings};
use dvr_ingest::config::Config;
use dvr_ingest::events::{EventPublisher, RabbitMqPublisher};
use dvr_ingest::logging::init_logging;
use dvr_ingest::metrics::{install_recorder, spawn_upkeep, HealthState};
use dvr_ingest::pipeline::{PipelineSettings, ProcessingPipeline};
use dvr_ingest::pool::WorkerPool;
use dvr_ingest::recovery::{RecoveryScanner, RecoveryTarget};
use dvr_ingest::staging::StreamStager;
use dvr_ingest::storage::{ObjectStore, S3ObjectStore, StorageError};
use dvr_ingest::transcoder::FfmpegTranscoder;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for broker connects and publishes
const BROKER_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        local_storage = config.enable_local_storage,
        disaster_recovery = config.disaster_recovery_mode,
        ts_to_mp4 = config.enable_ts_to_mp4,
        compression = config.enable_compression,
        s3_upload = config.enable_s3_upload,
        rabbitmq = config.enable_rabbitmq,
        workers = config.worker_count(),
        "Starting DVR ingest server"
    );

    match install_recorder() {
        Ok(handle) => spawn_upkeep(handle, Duration::from_secs(60)),
        Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
    }

    let object_store = build_object_store(&config)?;
    let publisher = build_publisher(&config).await;

    let health = Arc::new(HealthState::new());
    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.ffmpeg_path.clone(),
        config.ffprobe_path.clone(),
        config.transcode_timeout,
    ));
    let pipeline = Arc::new(ProcessingPipeline::new(
        PipelineSettings::from_config(&config),
        transcoder,
        object_store.clone(),
        publisher.clone(),
        health,
    ));
    let pool = WorkerPool::new(pipeline, config.worker_count());

    let scanner = Arc::new(RecoveryScanner::new(
        RecoveryTarget::from_config(&config),
        pool.clone(),
    ));
    let report = scanner.scan_once().await;
    tracing::info!(
        resubmitted = report.resubmitted,
        skipped_recent = report.skipped_recent,
        "Startup recovery scan complete"
    );
    if let Some(every) = config.recovery_interval {
        scanner.spawn(every);
    }

    let state = AppState {
        settings: Arc::new(IngestSettings::from_config(&config)),
        stager: StreamStager::new(),
        pool,
        object_store,
        publisher,
    };
    let app = create_api_server(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// `None` when uploads are switched off or the store is not configured
fn build_object_store(config: &Config) -> anyhow::Result<Option<Arc<dyn ObjectStore>>> {
    if !config.enable_s3_upload {
        return Ok(None);
    }
    match S3ObjectStore::new(config.object_store.clone()) {
        Ok(store) => Ok(Some(Arc::new(store))),
        Err(StorageError::NotConfigured) => {
            tracing::warn!("S3 upload enabled but bucket or endpoint missing, uploads will be skipped");
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to initialize object store client"),
    }
}

/// The broker may be down at startup; the publisher reconnects on first use
async fn build_publisher(config: &Config) -> Option<Arc<dyn EventPublisher>> {
    if !config.enable_rabbitmq {
        return None;
    }
    let publisher = match RabbitMqPublisher::new(config.rabbitmq.clone(), BROKER_TIMEOUT) {
        Ok(publisher) => publisher,
        Err(e) => {
            tracing::warn!(error = %e, "RabbitMQ publisher not created, events disabled");
            return None;
        }
    };
    if let Err(e) = publisher.connect().await {
        tracing::warn!(error = %e, "RabbitMQ not reachable at startup, continuing");
    }
    Some(Arc::new(publisher))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
