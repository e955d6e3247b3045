//! Parkhub - parking session ledger with live free-spot notifications
//!
//! Module structure:
//! - `domain/` - Core business types (Facility, Spot, Session, Charge, errors)
//! - `io/` - External interfaces (HTTP facade, observer listener, journal)
//! - `services/` - Business logic (Tariff resolver, Session ledger, Notification hub)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use parkhub::infra::{Config, Metrics};
use parkhub::io::{
    create_occupancy_channel, start_api_server, start_observer_listener, ApiState, Journal,
    JsonlJournal, NullJournal, ObserverListenerConfig,
};
use parkhub::services::{create_hub, SessionLedger, TariffResolver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parkhub - parking occupancy ledger and notification hub
#[derive(Parser, Debug)]
#[command(name = "parkhub", version, about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Register the configured facilities and their spots
fn seed_facilities(ledger: &SessionLedger, config: &Config) -> anyhow::Result<()> {
    for seed in config.facilities() {
        let facility = ledger
            .register_facility(seed.to_new_facility())
            .with_context(|| format!("Failed to register facility {:?}", seed.name))?;
        for number in &seed.spots {
            ledger
                .add_spot(facility.id, number)
                .with_context(|| format!("Failed to add spot {number:?} to {:?}", seed.name))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-request visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "parkhub_starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        http_port = %config.http_port(),
        observers_enabled = %config.observers_enabled(),
        observer_port = %config.observer_port(),
        stall_timeout_ms = %config.observer_stall_timeout().as_millis(),
        default_tariff = %config.default_tariff(),
        fallback_rate = %config.fallback_rate(),
        journal_enabled = %config.journal_enabled(),
        facilities = %config.facilities().len(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let journal: Arc<dyn Journal> = if config.journal_enabled() {
        Arc::new(JsonlJournal::new(config.journal_file()))
    } else {
        warn!("journal_disabled");
        Arc::new(NullJournal)
    };

    // Ledger -> hub event path
    let (events, event_rx) = create_occupancy_channel(metrics.clone());
    let (hub, worker) = create_hub(event_rx, config.observer_stall_timeout(), metrics.clone());
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let resolver = TariffResolver::new(config.default_tariff(), config.fallback_rate());
    let ledger = Arc::new(SessionLedger::new(resolver, journal, metrics.clone(), Some(events)));
    seed_facilities(&ledger, &config)?;

    // Start observer TCP listener
    let observer_config = ObserverListenerConfig {
        port: config.observer_port(),
        enabled: config.observers_enabled(),
    };
    let observer_hub = hub.clone();
    let observer_ledger = ledger.clone();
    let observer_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_observer_listener(observer_config, observer_hub, observer_ledger, observer_shutdown)
                .await
        {
            error!(error = %e, "observer_listener_error");
        }
    });

    // Start HTTP facade (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let state = Arc::new(ApiState {
            ledger: ledger.clone(),
            metrics: metrics.clone(),
            site_id: config.site_id().to_string(),
        });
        let api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(http_port, state, api_shutdown).await {
                error!(error = %e, "api_server_error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    info!(facilities = %ledger.facilities().len(), "parkhub_ready");

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Let the delivery worker flush queued events
    if tokio::time::timeout(Duration::from_secs(5), worker_handle).await.is_err() {
        warn!("delivery_worker_shutdown_timeout");
    }

    metrics.report().log();
    info!(observers = %hub.observer_count(), "parkhub shutdown complete");
    Ok(())
}
