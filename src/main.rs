//! Parkgate - unattended parking facility controller
//!
//! Drives gated entry/exit lanes: camera capture, ticket printing, barrier
//! actuation and duration-based fees, with per-facility serialized hardware
//! access.
//!
//! Module structure:
//! - `domain/` - Core business types (Session, Rates, Ticket)
//! - `io/` - External interfaces (device protocol, serial links, events,
//!   archive, control listener, Prometheus)
//! - `services/` - Business logic (HardwareCoordinator, SessionManager, Store)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use parkgate::domain::session::SessionId;
use parkgate::domain::types::{GateId, VehicleClass};
use parkgate::infra::{Config, Metrics};
use parkgate::io::control::ControlConfig;
use parkgate::io::{
    create_event_channel, start_control_listener, ControlDeps, ParkingEvent, SerialLink,
    SessionArchive,
};
use parkgate::services::hardware::HardwareCoordinator;
use parkgate::services::store::ParkingStore;
use parkgate::services::{MemoryStore, SessionManager};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parkgate - automated parking lane controller
#[derive(Parser, Debug)]
#[command(name = "parkgate", version, about)]
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

    info!("parkgate starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        gates = %config.gates().len(),
        car_spaces = %config.spaces().car,
        motorcycle_spaces = %config.spaces().motorcycle,
        control_port = %config.control_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(Metrics::new());
    let (events, mut event_rx) = create_event_channel(1000, config.site_id().to_string());

    // Seed the store: spaces per class and the bootstrap rate schedules
    let store = Arc::new(MemoryStore::new());
    store.seed_spaces(VehicleClass::Car, config.spaces().car);
    store.seed_spaces(VehicleClass::Motorcycle, config.spaces().motorcycle);
    store.seed_spaces(VehicleClass::Other, config.spaces().other);
    for schedule in config.bootstrap_schedules() {
        if let Err(problems) = schedule.validate() {
            warn!(class = %schedule.class, problems = ?problems, "rate_schedule_invalid");
        }
        store.add_schedule(schedule);
    }

    // One serial link per facility
    let camera_link = Arc::new(SerialLink::new(&config.camera().device, config.camera().baud));
    let printer_link = Arc::new(SerialLink::new(&config.printer().device, config.printer().baud));
    let gate_links: Vec<(GateId, Arc<dyn parkgate::io::DeviceLink>)> = config
        .gates()
        .iter()
        .map(|g| {
            (GateId(g.id), Arc::new(SerialLink::new(&g.device, g.baud)) as Arc<dyn parkgate::io::DeviceLink>)
        })
        .collect();

    let hardware = Arc::new(HardwareCoordinator::new(
        config.coordinator_settings(),
        camera_link,
        printer_link,
        gate_links,
        events.clone(),
        metrics.clone(),
    ));
    hardware.initialize_all().await;

    let manager = Arc::new(SessionManager::new(
        store.clone(),
        hardware.clone(),
        events.clone(),
        metrics.clone(),
        config.manager_settings(),
    ));

    // Event pump: forwards core events to the log and archives sessions that
    // reached a terminal state. The external broadcaster consumes the same
    // stream in production.
    let archive = SessionArchive::new(config.archive_file(), config.site_id());
    let archive_store: Arc<dyn ParkingStore> = store.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ParkingEvent::SessionState(payload) => {
                    debug!(sid = %payload.sid, prev = %payload.prev, new = %payload.new, "event_session_state");
                    if matches!(payload.new, "completed" | "rejected" | "cancelled") {
                        let sid = SessionId(payload.sid.clone());
                        match archive_store.load_session(&sid).await {
                            Ok(Some(session)) => {
                                archive.write_session(&session);
                            }
                            Ok(None) => {
                                warn!(sid = %payload.sid, "archive_session_missing")
                            }
                            Err(e) => warn!(sid = %payload.sid, error = %e, "archive_load_failed"),
                        }
                    }
                }
                ParkingEvent::FacilityState(payload) => {
                    debug!(facility = %payload.facility, prev = %payload.prev, new = %payload.new, "event_facility_state");
                }
            }
        }
    });

    // Stale-session sweep
    let sweep_manager = manager.clone();
    let sweep_interval = config.sweep_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            let swept = sweep_manager.sweep_stale().await;
            if swept > 0 {
                info!(swept, "stale_sessions_swept");
            }
        }
    });

    // Metrics reporter
    let report_metrics = metrics.clone();
    let report_store: Arc<dyn ParkingStore> = store.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let (occupied, total) = report_store.occupancy().await.unwrap_or((0, 0));
            report_metrics.report(occupied, total).log();
        }
    });

    // Prometheus endpoint (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_store: Arc<dyn ParkingStore> = store.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = parkgate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_store,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Control listener is the foreground task: lane stations and the
    // operator console drive everything through it
    let deps = ControlDeps { manager, hardware, store };
    let control_config =
        ControlConfig { port: config.control_port(), enabled: config.control_enabled() };
    if let Err(e) = start_control_listener(control_config, deps, shutdown_rx).await {
        tracing::error!(error = %e, "control listener error");
    }

    info!("parkgate shutdown complete");
    Ok(())
}
