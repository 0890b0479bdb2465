use anyhow::{Context, Result};
use event_recorder::config::{Config, LoggingConfig};
use event_recorder::ingest::pump_frames;
use event_recorder::reporter::FileLinker;
use event_recorder::{
    ActiveSegments, AlarmReporter, ChannelRegistry, Dispatcher, FfmpegSink, HttpAlarmTransport,
    JpegSnapshotWriter, RetentionService,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging);

    let settings = config.validate().context("Invalid configuration")?;

    info!(
        service = %settings.service.name,
        save_dir = %settings.recorder.save_dir.display(),
        record_secs = settings.recorder.record_duration.as_secs(),
        trigger_classes = ?settings.recorder.trigger.classes,
        "Starting event recorder"
    );

    if settings.service.enable_metrics {
        init_metrics(settings.service.metrics_port)?;
    }

    std::fs::create_dir_all(&settings.recorder.save_dir).with_context(|| {
        format!(
            "Failed to create save directory {}",
            settings.recorder.save_dir.display()
        )
    })?;

    let token = CancellationToken::new();
    let active = ActiveSegments::new();
    let recorder_settings = Arc::new(settings.recorder.clone());

    let sink = Arc::new(FfmpegSink::new(
        recorder_settings.ffmpeg_path.clone(),
        recorder_settings.video_codec.clone(),
    ));
    let registry = Arc::new(ChannelRegistry::new(
        recorder_settings.clone(),
        sink,
        Arc::new(JpegSnapshotWriter),
        active.clone(),
    ));

    let transport = Arc::new(
        HttpAlarmTransport::new(settings.report.request_timeout)
            .context("Failed to build HTTP client")?,
    );
    let reporter = Arc::new(AlarmReporter::new(
        settings.report.endpoint.clone(),
        settings.report.fields.clone(),
        settings.report.video_field,
        FileLinker::new(
            recorder_settings.save_dir.clone(),
            settings.report.base_file_url.clone(),
        ),
        transport,
    ));

    // Spawn retention task
    let retention = settings.retention.map(|policy| {
        RetentionService::new(recorder_settings.save_dir.clone(), policy, active.clone())
            .spawn(token.child_token())
    });
    if retention.is_none() {
        info!("Storage retention disabled");
    }

    let mut dispatcher = Dispatcher::new(
        registry,
        reporter,
        recorder_settings.queue_size,
        token.clone(),
    );

    info!("Event recorder started, reading frames from stdin");

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = pump_frames(stdin, &mut dispatcher, &token) => {
            match result {
                Ok(stats) => info!(
                    lines = stats.lines,
                    dispatched = stats.dispatched,
                    skipped = stats.skipped,
                    "Input exhausted"
                ),
                Err(e) => warn!(error = %e, "Input stream failed"),
            }
        }
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
            token.cancel();
        }
    }

    dispatcher.shutdown().await;

    if let Some(handle) = retention {
        handle.stop().await;
    }

    info!("Event recorder stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().json()).init(),
    }
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
