//! Presence bridge - fuses camera presence and ESP32 sensor lines into live events
//!
//! Execution contexts:
//! - serial bridge (`services::serial_bridge`) - sensor board lines to events
//! - vision worker (`services::vision_worker`) - capture, classify, track presence
//! - HTTP server (`io::http_server`) - MJPEG stream, WebSocket events, health, metrics
//!
//! They share only the frame buffer and the event hub.

use clap::Parser;
use presence_bridge::infra::{Config, Metrics};
use presence_bridge::io::camera;
use presence_bridge::io::classifier::{Classifier, HttpClassifier};
use presence_bridge::io::http_server::HttpServer;
use presence_bridge::io::serial::SerialSettings;
use presence_bridge::services::{
    EventDispatchHub, FrameBroadcastBuffer, SerialBridge, VisionSettings, VisionWorker,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Presence bridge - real-time camera and sensor event bridge
#[derive(Parser, Debug)]
#[command(name = "presence-bridge", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "presence-bridge starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config);
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        bind = %config.bind_address(),
        port = %config.server_port(),
        confidence_threshold = %config.confidence_threshold(),
        detection_interval_ms = %config.detection_interval().as_millis(),
        lost_timeout_ms = %config.lost_timeout().as_millis(),
        serial_port = %config.serial_port().unwrap_or("auto"),
        serial_baud = %config.serial_baud(),
        poles = %config.poles().len(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared surfaces
    let metrics = Arc::new(Metrics::new());
    let frames = Arc::new(FrameBroadcastBuffer::new());
    let hub = Arc::new(EventDispatchHub::with_pole_baseline(
        config.poles(),
        config.subscriber_buffer(),
        metrics.clone(),
    ));

    // Serial bridge
    let serial_bridge = SerialBridge::new(
        SerialSettings::from_config(&config),
        config.poles().clone(),
        hub.clone(),
        metrics.clone(),
    );
    tokio::spawn(serial_bridge.run(shutdown_rx.clone()));

    // Vision worker; a missing classifier still leaves the video stream running
    match camera::from_config(&config) {
        Ok(source) => {
            let classifier: Option<Arc<dyn Classifier>> = match HttpClassifier::from_config(&config) {
                Ok(classifier) => {
                    info!(
                        url = %config.classifier_url(),
                        labels = %classifier.labels().len(),
                        "classifier_ready"
                    );
                    Some(Arc::new(classifier) as Arc<dyn Classifier>)
                }
                Err(e) => {
                    warn!(error = %e, "classifier_disabled");
                    None
                }
            };
            let worker = VisionWorker::new(
                source,
                classifier,
                VisionSettings::from_config(&config),
                frames.clone(),
                hub.clone(),
                metrics.clone(),
            );
            tokio::spawn(worker.run(shutdown_rx.clone()));
        }
        Err(e) => error!(error = %e, "camera_unavailable"),
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = presence_bridge::infra::shutdown::signalled(&mut metrics_shutdown) => return,
                _ = interval.tick() => metrics_clone.report().log(),
            }
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Only failure to start the server ends the process
    let server = HttpServer::new(&config, frames, hub, metrics.clone(), shutdown_rx);
    if let Err(e) = server.run().await {
        error!(error = %e, "http_server_failed");
        return Err(e);
    }

    metrics.report().log();
    info!("presence-bridge shutdown complete");
    Ok(())
}
