//! Spotwatch - smart-parking overtime reconciliation engine
//!
//! Continuously reconciles three independently-updating sources of truth
//! (booking expiry times, IoT spot sensors, the backend billing ledger) to
//! decide in real time whether a parked vehicle has overstayed, how much to
//! charge, and when a session is complete.
//!
//! Module structure:
//! - `domain/` - Core business types (Booking, ParkingSession, readings)
//! - `io/` - External interfaces (backend REST, notifications, session log)
//! - `services/` - Business logic (state machine, grace, billing, monitor)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use spotwatch::infra::{Config, Metrics};
use spotwatch::io::{create_notify_channel, HttpBackend};
use spotwatch::services::spawn_monitor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Spotwatch - parking overtime detection and billing reconciliation
#[derive(Parser, Debug)]
#[command(name = "spotwatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "spotwatch starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        backend = %config.backend_base_url(),
        sensor_interval_secs = %config.sensor_poll_interval_secs(),
        fallback_interval_secs = %config.fallback_poll_interval_secs(),
        grace_secs = %config.grace_period_secs(),
        session_log = %config.session_log_file(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());

    let backend = Arc::new(HttpBackend::new(
        config.backend_base_url(),
        config.backend_auth_token(),
        Duration::from_millis(config.backend_timeout_ms()),
    )?);

    // Notification channel; the host dispatcher owns delivery, this consumer
    // just logs the requests
    let (notify, mut notify_rx) = create_notify_channel(config.notify_buffer(), metrics.clone());
    tokio::spawn(async move {
        while let Some(event) = notify_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => info!(event = %event.event_key(), payload = %payload, "notify_request"),
                Err(e) => error!(error = %e, "notify_serialize_failed"),
            }
        }
    });

    // Periodic metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            // Session counts live in the monitor; report remote-call counters
            let summary = metrics_clone.report(0, 0);
            summary.log();
        }
    });

    let (handle, join) = spawn_monitor(config, backend, notify, metrics);
    info!("monitor_spawned");

    // Handle shutdown on Ctrl+C
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        shutdown_handle.stop();
    });

    join.await?;

    info!("spotwatch shutdown complete");
    Ok(())
}
