//! Gatepass - visitor pass and plate-recognition checkpoint service
//!
//! Module structure:
//! - `domain/` - Core types (Pass, EntryCode, Plate, GateError)
//! - `io/` - External interfaces (HTTP API, journal, recognizer, camera, MQTT)
//! - `services/` - Business logic (registry, lifecycle, recognition, checkpoint)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use gatepass::infra::{Config, Metrics};
use gatepass::io::{bind_api, serve_api, ApiState, HttpPlateRecognizer, HttpSnapshotCamera, MqttStatusPublisher};
use gatepass::services::{Checkpoint, PassRegistry, RecognitionOrchestrator, RecognitionPolicy, StatusNotifier};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Gatepass - visitor pass checkpoint service
#[derive(Parser, Debug)]
#[command(name = "gatepass", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-attempt recognition detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "gatepass starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config)?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        bind = %config.bind_address(),
        port = %config.server_port(),
        journal = %config.journal_file().unwrap_or("<memory>"),
        recognizer = %config.recognizer_url(),
        camera = %config.camera_snapshot_url().unwrap_or("<none>"),
        max_attempts = %config.recognition_max_attempts(),
        mqtt_enabled = %config.mqtt_enabled(),
        "config_loaded"
    );
    if config.checkpoint_tokens().is_empty() && config.admin_tokens().is_empty() {
        warn!("no_api_tokens_configured");
    }

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(PassRegistry::from_config(&config).context("Failed to open pass registry")?);
    let notifier = Arc::new(StatusNotifier::new(registry.clone(), config.notify_capacity()));
    let mut checkpoint = Checkpoint::new(registry, notifier.clone(), metrics.clone());

    match HttpSnapshotCamera::from_config(&config)? {
        Some(camera) => {
            let recognizer = HttpPlateRecognizer::from_config(&config)?;
            let orchestrator = RecognitionOrchestrator::new(
                Arc::new(camera),
                Arc::new(recognizer),
                RecognitionPolicy::from_config(&config),
                metrics.clone(),
            );
            checkpoint = checkpoint.with_orchestrator(Arc::new(orchestrator));
        }
        None => warn!("camera_not_configured_scans_disabled"),
    }
    let checkpoint = Arc::new(checkpoint);

    // Start MQTT status publisher (if enabled)
    if config.mqtt_enabled() {
        let publisher = MqttStatusPublisher::new(&config, notifier.subscribe());
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        metrics_clone.report().log();
                        return;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run the API server until shutdown
    let listener = bind_api(&config).await?;
    let state = Arc::new(ApiState::new(checkpoint, &config));
    serve_api(listener, state, shutdown_rx).await?;

    info!("gatepass shutdown complete");
    Ok(())
}
