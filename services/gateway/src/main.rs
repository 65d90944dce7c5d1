use anyhow::{Context, Result};
use dicom_gateway::config::{Config, ServiceConfig};
use dicom_gateway::{CompletionMonitor, EngineSettings, IngestHandler, InstanceConsumer, KafkaSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        root = %config.storage.root.display(),
        "Starting DICOM gateway"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let sink = Arc::new(KafkaSink::new(
        config.kafka.clone(),
        config.publisher.delivery_timeout(),
    ));

    // Pending notifications from a previous run are delivered before any consumer starts
    let handler = Arc::new(
        IngestHandler::open(EngineSettings::from_config(&config), sink.clone())
            .await
            .context("Failed to open ingest handler")?,
    );

    let stop = CancellationToken::new();

    let monitor = CompletionMonitor::new(handler.clone(), config.completion.sweep_interval());
    let monitor_handle = tokio::spawn(monitor.run(stop.clone()));

    let mut consumer_handles = Vec::with_capacity(config.ingest.workers);
    for worker in 0..config.ingest.workers {
        let consumer = InstanceConsumer::new(&config.kafka, handler.clone(), worker)
            .context("Failed to initialize Kafka consumer")?;
        let stop = stop.clone();
        consumer_handles.push(tokio::spawn(async move {
            if let Err(e) = consumer.run(stop).await {
                error!(worker, error = %e, "Instance consumer error");
            }
        }));
    }

    info!(workers = config.ingest.workers, "DICOM gateway started");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down DICOM gateway");

    stop.cancel();
    for handle in consumer_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Consumer task ended abnormally");
        }
    }
    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "Monitor task ended abnormally");
    }

    // Finishes in-flight ingests and publishes
    handler.shutdown().await;

    if let Err(e) = sink.flush(Duration::from_secs(10)) {
        warn!(error = %e, "Failed to flush Kafka sink");
    }

    info!("DICOM gateway stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if service.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }
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
