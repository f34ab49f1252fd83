//! Parkgate - gate hardware control and realtime coordination
//!
//! Drives the entry and exit gate peripherals over serial, correlates
//! command acknowledgments, streams events to operator consoles, and
//! journals transactions while the central store is unreachable.
//!
//! Module structure:
//! - `domain/` - Core business types (gates, commands, events)
//! - `io/` - External interfaces (serial, console, HTTP)
//! - `services/` - Business logic (dispatcher, monitor, hub, offline queue)
//! - `infra/` - Infrastructure (config, metrics)

use clap::Parser;
use parkgate::domain::types::GateId;
use parkgate::infra::{Config, Metrics};
use parkgate::io::{start_api_server, ApiContext, CommandPort, ConsoleListener, SerialLink};
use parkgate::services::hub::CommandRouter;
use parkgate::services::{
    ConnectionStatusMonitor, GateCommandDispatcher, HubEvent, OfflineQueue, OfflineReplayer,
    ProbeTarget, RealtimeHub, TcpSyncSink,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parkgate - parking facility gate control service
#[derive(Parser, Debug)]
#[command(name = "parkgate", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to the CONFIG_FILE
    /// environment variable, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
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

    info!(version = env!("GIT_HASH"), "parkgate starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        entry_device = %config.endpoint(GateId::Entry).device,
        exit_device = %config.endpoint(GateId::Exit).device,
        console_port = %config.console_port(),
        http_port = %config.http_port(),
        offline_journal = %config.offline_journal(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let metrics = Arc::new(Metrics::new());

    // Peripheral event fan-in channel (bounded for backpressure)
    let (event_tx, mut event_rx) = mpsc::channel(1024);

    // One serial link per gate; each owns its port exclusively
    let entry_link = Arc::new(SerialLink::new(
        GateId::Entry,
        &config,
        event_tx.clone(),
        metrics.clone(),
    ));
    let exit_link = Arc::new(SerialLink::new(GateId::Exit, &config, event_tx, metrics.clone()));

    let mut targets = FxHashMap::default();
    for link in [&entry_link, &exit_link] {
        let endpoint = config.endpoint(link.gate());
        targets.insert(
            link.gate(),
            ProbeTarget {
                camera_addr: endpoint.camera_addr.clone(),
                printer_addr: endpoint.printer_addr.clone(),
                link: link.state(),
            },
        );
    }
    let monitor = Arc::new(ConnectionStatusMonitor::new(&config, targets));

    let hub = Arc::new(RealtimeHub::new(monitor.clone(), metrics.clone()));

    let mut dispatcher =
        GateCommandDispatcher::new(&config, monitor.clone(), hub.clone(), metrics.clone());
    dispatcher.register_gate(GateId::Entry, entry_link.clone());
    dispatcher.register_gate(GateId::Exit, exit_link.clone());
    let dispatcher = Arc::new(dispatcher);

    let router = Arc::new(CommandRouter::new(dispatcher.clone(), monitor.clone(), hub.clone()));
    let offline = Arc::new(OfflineQueue::from_config(&config)?);

    // Serial links
    tokio::spawn(entry_link.run(shutdown_rx.clone()));
    tokio::spawn(exit_link.run(shutdown_rx.clone()));

    // Device status monitor
    tokio::spawn(monitor.clone().run(hub.clone(), shutdown_rx.clone()));

    // Operator console
    if config.console_enabled() {
        let console = Arc::new(ConsoleListener::new(&config, hub.clone(), router));
        let console_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = console.run(console_shutdown).await {
                tracing::error!(error = %e, "console listener error");
            }
        });
    }

    // HTTP API (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let ctx = Arc::new(ApiContext {
            dispatcher: dispatcher.clone(),
            monitor: monitor.clone(),
            offline: offline.clone(),
            metrics: metrics.clone(),
            site_id: config.site_id().to_string(),
        });
        let api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(http_port, ctx, api_shutdown).await {
                tracing::error!(error = %e, "HTTP API error");
            }
        });
    }

    // Offline replay to the central store (if configured)
    if let Some(store_addr) = config.offline_store_addr() {
        let sink = TcpSyncSink::new(store_addr, Duration::from_secs(5));
        let replayer = OfflineReplayer::new(offline.clone(), Box::new(sink), &config);
        tokio::spawn(replayer.run(shutdown_rx.clone()));
    }

    // Metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    info!("parkgate_started");

    // Main event pump: every decoded peripheral line flows through here.
    // Pending commands get first claim on a matching reply; everything,
    // claimed or not, is broadcast to the consoles.
    let mut pump_shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = pump_shutdown.changed() => {
                if *pump_shutdown.borrow() {
                    break;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                monitor.note_activity(event.gate);
                dispatcher.offer_reply(event.gate, &event);
                hub.publish(HubEvent::Peripheral { event });
            }
        }
    }

    info!("parkgate shutdown complete");
    Ok(())
}
