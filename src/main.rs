//! LiftLink - headless harness driver
//!
//! Scans for the sensor harness, runs measurement sessions and lists saved
//! sessions.
//!
//! Usage:
//!   liftlink scan
//!   liftlink check
//!   liftlink measure [SECONDS]
//!   liftlink history
//!   liftlink delete <SESSION_ID>

use anyhow::{bail, Context, Result};
use crossbeam::channel::Receiver;
use liftlink::measurement::{MeasurementController, SessionStatus};
use liftlink::sensors::{BleController, BleEvent, ConnectionStatus, GrantAll, PeripheralInfo};
use liftlink::storage::config::{load_config, AppConfig};
use liftlink::storage::session_store::{SessionStore, SqliteSessionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_MEASURE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LiftLink v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config().context("loading configuration")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("scan") | None => scan(&config).await,
        Some("check") => check(&config).await,
        Some("measure") => {
            let secs = match args.get(1) {
                Some(raw) => raw.parse().with_context(|| format!("invalid duration {:?}", raw))?,
                None => DEFAULT_MEASURE_SECS,
            };
            measure(&config, Duration::from_secs(secs)).await
        }
        Some("history") => history(&config),
        Some("delete") => {
            let raw = args.get(1).context("delete needs a session id")?;
            let id = Uuid::parse_str(raw).with_context(|| format!("invalid session id {:?}", raw))?;
            open_store(&config)?.delete(&id)?;
            println!("Deleted session {}", id);
            Ok(())
        }
        Some(other) => bail!("unknown command {:?}", other),
    }
}

/// Headless and harness-only, so permissions are granted.
async fn open_ble(config: &AppConfig) -> Result<(Arc<BleController>, Receiver<BleEvent>)> {
    let mut ble = BleController::new(config.ble.clone(), Arc::new(GrantAll));
    ble.initialize().await?;
    let events = ble.event_receiver();
    Ok((Arc::new(ble), events))
}

fn open_store(config: &AppConfig) -> Result<Arc<SqliteSessionStore>> {
    let path = config.database_path();
    let store = SqliteSessionStore::open(&path)
        .with_context(|| format!("opening session database {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn scan(config: &AppConfig) -> Result<()> {
    let (ble, events) = open_ble(config).await?;
    ble.start_scan().await?;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    'scan: loop {
        ticker.tick().await;
        while let Ok(event) = events.try_recv() {
            match event {
                BleEvent::Discovered(info) => print_peripheral(&info),
                BleEvent::ScanStopped => break 'scan,
                BleEvent::Error(message) => tracing::error!("{}", message),
                _ => {}
            }
        }
    }

    ble.release().await;
    Ok(())
}

/// Scan until the first matching harness shows up, then connect to it.
async fn connect_harness(
    ble: &BleController,
    events: &Receiver<BleEvent>,
    config: &AppConfig,
) -> Result<String> {
    let name_filter = config.ble.name_filter.as_deref();
    ble.start_scan().await?;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let found = 'scan: loop {
        ticker.tick().await;
        while let Ok(event) = events.try_recv() {
            match event {
                BleEvent::Discovered(info) => {
                    print_peripheral(&info);
                    if info.is_harness_candidate(name_filter) {
                        break 'scan Some(info);
                    }
                    tracing::debug!("Skipping {}: not a harness", info.address);
                }
                BleEvent::ScanStopped => break 'scan None,
                _ => {}
            }
        }
    };

    let Some(harness) = found else {
        bail!("no harness found");
    };
    ble.stop_scan().await?;

    tracing::info!("Connecting to {}", harness.display_name());
    ble.connect(&harness.address).await?;
    Ok(harness.address)
}

async fn check(config: &AppConfig) -> Result<()> {
    let (ble, events) = open_ble(config).await?;
    let address = connect_harness(&ble, &events, config).await?;
    let store = open_store(config)?;
    let controller = MeasurementController::new(
        ble.clone(),
        store,
        config.owner.to_owner(),
        config.session.clone(),
    );

    if !controller.check_companion() {
        bail!("companion check could not be sent");
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    while Instant::now() < deadline && controller.snapshot().companion.is_none() {
        ticker.tick().await;
        route_events(&events, &controller);
    }

    match controller.snapshot().companion {
        Some(status) => println!("Companion unit on {}: {:?}", address, status),
        None => println!("Companion unit on {}: no answer", address),
    }

    ble.release().await;
    Ok(())
}

async fn measure(config: &AppConfig, duration: Duration) -> Result<()> {
    let (ble, events) = open_ble(config).await?;
    connect_harness(&ble, &events, config).await?;
    let store = open_store(config)?;
    let controller = MeasurementController::new(
        ble.clone(),
        store,
        config.owner.to_owner(),
        config.session.clone(),
    );

    if !controller.start() {
        ble.release().await;
        bail!("measurement could not be started");
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let stop_at = Instant::now() + duration;
    while Instant::now() < stop_at && controller.status() == SessionStatus::Measuring {
        ticker.tick().await;
        route_events(&events, &controller);
    }

    controller.stop();

    let grace = Duration::from_millis(config.session.finalize_timeout_ms) + Duration::from_secs(2);
    let give_up = Instant::now() + grace;
    while controller.status().is_busy() && Instant::now() < give_up {
        ticker.tick().await;
        route_events(&events, &controller);
    }

    let snapshot = controller.snapshot();
    println!("Session: {}", snapshot.status);
    if snapshot.dropped_messages > 0 {
        println!("  {} messages dropped", snapshot.dropped_messages);
    }
    for point in &snapshot.series {
        println!("  #{:<5} {:>8} ms  {:>7.2}°", point.index, point.timestamp_ms, point.angle_delta);
    }

    ble.release().await;
    if snapshot.status == SessionStatus::Error {
        bail!("session could not be saved");
    }
    Ok(())
}

fn history(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let sessions = store.list(&config.owner.user_id, &config.owner.athlete_id)?;

    if sessions.is_empty() {
        println!("No sessions for athlete {}", config.owner.athlete_id);
        return Ok(());
    }

    for session in sessions {
        let series = session.correlated_series();
        let peak = series.iter().map(|p| p.angle_delta).fold(0.0_f64, f64::max);
        println!(
            "{}  {}  {} samples  peak {:.1}°",
            session.id,
            session.timestamp.format("%Y-%m-%d %H:%M:%S"),
            session.samples.len(),
            peak
        );
    }
    Ok(())
}

/// Forward pending BLE events to the measurement controller.
fn route_events(events: &Receiver<BleEvent>, controller: &MeasurementController) {
    while let Ok(event) = events.try_recv() {
        match event {
            BleEvent::Notification { address, payload } => {
                controller.on_notification(&address, &payload)
            }
            BleEvent::ConnectionChanged {
                address,
                status: ConnectionStatus::Disconnected,
            } => controller.on_link_lost(&address),
            BleEvent::LinkFault { address, fault } => {
                tracing::warn!("Harness {} unusable: {}", address, fault)
            }
            BleEvent::Error(message) => tracing::error!("{}", message),
            _ => {}
        }
    }
}

fn print_peripheral(info: &PeripheralInfo) {
    match info.signal_strength {
        Some(rssi) => println!("{}  {}  {} dBm", info.address, info.display_name(), rssi),
        None => println!("{}  {}", info.address, info.display_name()),
    }
}
