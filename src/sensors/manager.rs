//! BLE controller for the sensor harness.
//!
//! Owns the btleplug adapter, the peripheral registry and one [`Link`] state
//! machine per peripheral. Every asynchronous GATT step is performed here and
//! its completion is fed back to the link as a [`LinkEvent`]; the link decides
//! what happens next.

use crate::sensors::command::CommandLink;
use crate::sensors::link::{
    DiscoveredCharacteristic, DiscoveredService, Link, LinkAction, LinkEvent, LinkState,
};
use crate::sensors::permissions::PermissionProvider;
use crate::sensors::protocol::{Command, HARNESS_NOTIFY_UUID, HARNESS_SERVICE_UUID};
use crate::sensors::registry::{matches_name_filter, PeripheralRegistry, RegistrySnapshot};
use crate::sensors::types::{BleConfig, BleError, BleEvent, ConnectionStatus, PeripheralInfo};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use crossbeam::channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Per-peripheral link bookkeeping.
struct LinkEntry {
    link: Link,
    peripheral: Peripheral,
    writer: Option<mpsc::UnboundedSender<Command>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkEntry {
    /// Release the native connection, then stop the link's tasks.
    async fn close(self) {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            if let Err(e) = self.peripheral.disconnect().await {
                tracing::warn!("Failed to close link: {}", e);
            }
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// State shared between the controller and its background tasks.
struct Shared {
    config: BleConfig,
    permissions: Arc<dyn PermissionProvider>,
    registry: Mutex<PeripheralRegistry>,
    links: Mutex<HashMap<String, LinkEntry>>,
    event_tx: Mutex<Option<Sender<BleEvent>>>,
}

/// Manages harness discovery, connection and command writes.
pub struct BleController {
    adapter: Option<Adapter>,
    shared: Arc<Shared>,
}

impl BleController {
    /// Create a new controller.
    pub fn new(config: BleConfig, permissions: Arc<dyn PermissionProvider>) -> Self {
        Self {
            adapter: None,
            shared: Arc::new(Shared {
                config,
                permissions,
                registry: Mutex::new(PeripheralRegistry::new()),
                links: Mutex::new(HashMap::new()),
                event_tx: Mutex::new(None),
            }),
        }
    }

    /// Initialize the BLE adapter.
    ///
    /// This must be called before scanning or connecting.
    pub async fn initialize(&mut self) -> Result<(), BleError> {
        tracing::info!("Initializing BleController");

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");
        self.adapter = Some(adapter);
        Ok(())
    }

    /// Get a receiver for link events.
    pub fn event_receiver(&mut self) -> Receiver<BleEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        *lock(&self.shared.event_tx) = Some(tx);
        rx
    }

    fn adapter(&self) -> Result<&Adapter, BleError> {
        self.adapter.as_ref().ok_or(BleError::AdapterNotFound)
    }

    /// Start scanning. Stops by itself after the configured timeout.
    pub async fn start_scan(&self) -> Result<(), BleError> {
        if !self.shared.permissions.can_scan() {
            tracing::warn!("Scan permission not granted");
            return Ok(());
        }
        let adapter = self.adapter()?.clone();

        let Some(generation) = lock(&self.shared.registry).begin_scan() else {
            return Ok(());
        };

        tracing::info!("Starting BLE scan");

        if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
            lock(&self.shared.registry).end_scan();
            return Err(BleError::ScanFailed(e.to_string()));
        }
        self.shared.send_event(BleEvent::ScanStarted);

        let shared = self.shared.clone();
        let scan_adapter = adapter.clone();
        tokio::spawn(async move {
            shared.process_discovery_events(scan_adapter, generation).await;
        });

        self.shared.spawn_scan_timeout(Some(adapter), generation);

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scan(&self) -> Result<(), BleError> {
        let adapter = self.adapter()?;

        if !lock(&self.shared.registry).end_scan() {
            return Ok(());
        }

        tracing::info!("Stopping BLE scan");
        adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanFailed(e.to_string()))?;
        self.shared.send_event(BleEvent::ScanStopped);
        Ok(())
    }

    /// Connect to a harness by address.
    ///
    /// No-op if permission is missing or the peripheral is already connected
    /// or connecting. A link that comes up without the harness service stays
    /// connected and reports a fault instead of failing.
    pub async fn connect(&self, address: &str) -> Result<(), BleError> {
        if !self.shared.permissions.can_connect() {
            tracing::warn!("Connect permission not granted");
            return Ok(());
        }
        if lock(&self.shared.links).contains_key(address) {
            tracing::debug!("Already connected or connecting to {}", address);
            return Ok(());
        }

        let adapter = self.adapter()?;
        let peripheral = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| BleError::PeripheralNotFound(address.to_string()))?;

        tracing::info!("Connecting to harness: {}", address);

        {
            let mut links = lock(&self.shared.links);
            if links.contains_key(address) {
                return Ok(());
            }
            links.insert(
                address.to_string(),
                LinkEntry {
                    link: Link::new(address, Some(self.shared.config.preferred_mtu)),
                    peripheral: peripheral.clone(),
                    writer: None,
                    tasks: Vec::new(),
                },
            );
        }

        self.shared
            .drive(&peripheral, address, LinkEvent::ConnectRequested)
            .await;

        match self.shared.link_state(address) {
            Some(LinkState::Ready) => {
                self.shared.spawn_link_tasks(address);
                tracing::info!("Harness ready: {}", address);
                Ok(())
            }
            Some(LinkState::ServiceDiscovery) => {
                self.shared.spawn_link_tasks(address);
                Ok(())
            }
            _ => Err(BleError::ConnectionFailed(address.to_string())),
        }
    }

    /// Disconnect from a peripheral. Safe to call when already disconnected.
    pub async fn disconnect(&self, address: &str) -> Result<(), BleError> {
        if !self.shared.permissions.can_connect() {
            tracing::warn!("Connect permission not granted to disconnect");
            return Ok(());
        }

        tracing::info!("Disconnecting from harness: {}", address);

        let peripheral = lock(&self.shared.links)
            .get(address)
            .map(|entry| entry.peripheral.clone());

        match peripheral {
            Some(peripheral) => {
                self.shared
                    .drive(&peripheral, address, LinkEvent::DisconnectRequested)
                    .await;
            }
            None => {
                lock(&self.shared.registry).mark_disconnected(address);
            }
        }
        Ok(())
    }

    /// Release every link and stop scanning.
    pub async fn release(&self) {
        tracing::info!("Releasing all Bluetooth resources");

        let addresses: Vec<String> = lock(&self.shared.links).keys().cloned().collect();
        for address in addresses {
            if let Some(entry) = self.shared.release(&address) {
                entry.close().await;
            }
        }

        if self.adapter.is_some() {
            if let Err(e) = self.stop_scan().await {
                tracing::warn!("Failed to stop scan during release: {}", e);
            }
        }
    }

    /// Current scanned/connected/scanning view.
    ///
    /// Names are withheld while connect permission is missing.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let snapshot = lock(&self.shared.registry).snapshot();
        if self.shared.permissions.can_connect() {
            snapshot
        } else {
            snapshot.redacted()
        }
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.registry).is_scanning()
    }

    /// Internal link state for a peripheral, if one is tracked.
    pub fn link_state(&self, address: &str) -> Option<LinkState> {
        self.shared.link_state(address)
    }
}

impl CommandLink for BleController {
    fn connected_addresses(&self) -> Vec<String> {
        lock(&self.shared.registry).connected_addresses()
    }

    fn send_command(&self, address: &str, command: Command) -> Result<(), BleError> {
        let links = lock(&self.shared.links);
        let entry = links
            .get(address)
            .ok_or_else(|| BleError::NotConnected(address.to_string()))?;
        if !entry.link.can_send_commands() {
            return Err(BleError::WriteUnavailable(address.to_string()));
        }
        let writer = entry
            .writer
            .as_ref()
            .ok_or_else(|| BleError::WriteUnavailable(address.to_string()))?;

        writer
            .send(command)
            .map_err(|_| BleError::NotConnected(address.to_string()))?;
        tracing::info!("Queued command {} for {}", command, address);
        Ok(())
    }
}

impl Shared {
    /// Stop the scan started as `generation` once the scan timeout elapses,
    /// unless it was stopped or replaced in the meantime.
    fn spawn_scan_timeout(
        self: &Arc<Self>,
        adapter: Option<Adapter>,
        generation: u64,
    ) -> JoinHandle<()> {
        let shared = self.clone();
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !lock(&shared.registry).end_scan_if(generation) {
                return;
            }
            tracing::info!("Scan timed out after {}s", timeout.as_secs());
            if let Some(adapter) = adapter {
                if let Err(e) = adapter.stop_scan().await {
                    tracing::warn!("Failed to stop scan: {}", e);
                }
            }
            shared.send_event(BleEvent::ScanStopped);
        })
    }

    fn send_event(&self, event: BleEvent) {
        if let Some(tx) = lock(&self.event_tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn link_state(&self, address: &str) -> Option<LinkState> {
        lock(&self.links).get(address).map(|entry| entry.link.state())
    }

    /// Feed one event to a link and publish any visible state change.
    fn apply(&self, address: &str, event: LinkEvent) -> Vec<LinkAction> {
        let (actions, before, after, status_changed) = {
            let mut links = lock(&self.links);
            let Some(entry) = links.get_mut(address) else {
                return Vec::new();
            };
            let before = entry.link.state();
            let status_before = entry.link.connection_status();
            let actions = entry.link.handle(event);
            let after = entry.link.state();
            let status = entry.link.connection_status();
            (actions, before, after, (status != status_before).then_some(status))
        };

        if before != after {
            self.send_event(BleEvent::LinkStateChanged {
                address: address.to_string(),
                state: after,
            });
        }

        match status_changed {
            Some(ConnectionStatus::Connecting) => {
                lock(&self.registry).mark_connecting(address);
                self.send_event(BleEvent::ConnectionChanged {
                    address: address.to_string(),
                    status: ConnectionStatus::Connecting,
                });
            }
            Some(ConnectionStatus::Connected) => {
                {
                    let mut registry = lock(&self.registry);
                    let info = registry
                        .find(address)
                        .cloned()
                        .unwrap_or_else(|| PeripheralInfo::new(address, None));
                    registry.mark_connected(info);
                }
                self.send_event(BleEvent::ConnectionChanged {
                    address: address.to_string(),
                    status: ConnectionStatus::Connected,
                });
            }
            // Disconnection is published by `release`.
            Some(ConnectionStatus::Disconnected) | None => {}
        }

        actions
    }

    /// Run a link from `event` until it has no more work to do.
    async fn drive(&self, peripheral: &Peripheral, address: &str, event: LinkEvent) {
        let mut pending: VecDeque<LinkAction> = self.apply(address, event).into();
        while let Some(action) = pending.pop_front() {
            if let Some(next) = self.perform(peripheral, address, action).await {
                pending.extend(self.apply(address, next));
            }
        }
    }

    /// Perform one transport action and report its completion.
    async fn perform(
        &self,
        peripheral: &Peripheral,
        address: &str,
        action: LinkAction,
    ) -> Option<LinkEvent> {
        match action {
            LinkAction::Connect => {
                let timeout = Duration::from_secs(self.config.connect_timeout_secs);
                Some(match tokio::time::timeout(timeout, peripheral.connect()).await {
                    Ok(Ok(())) => LinkEvent::Connected,
                    Ok(Err(e)) => LinkEvent::GattError {
                        reason: e.to_string(),
                    },
                    Err(_) => LinkEvent::GattError {
                        reason: BleError::ConnectionTimeout.to_string(),
                    },
                })
            }
            LinkAction::RequestMtu(mtu) => {
                // btleplug leaves the MTU exchange to the platform stack.
                tracing::debug!("Requested MTU {} for {}; negotiated by platform", mtu, address);
                Some(LinkEvent::MtuNegotiated { mtu: None })
            }
            LinkAction::DiscoverServices => Some(match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered(describe_services(peripheral)),
                Err(e) => LinkEvent::GattError {
                    reason: e.to_string(),
                },
            }),
            LinkAction::EnableNotifications { characteristic } => {
                let found = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == characteristic);
                let success = match found {
                    Some(c) => match peripheral.subscribe(&c).await {
                        Ok(()) => {
                            tracing::info!("Notifications enabled on {}", address);
                            true
                        }
                        Err(e) => {
                            tracing::error!("Failed to write descriptor on {}: {}", address, e);
                            false
                        }
                    },
                    None => false,
                };
                Some(LinkEvent::DescriptorWritten { success })
            }
            LinkAction::ReportFault(fault) => {
                self.send_event(BleEvent::LinkFault {
                    address: address.to_string(),
                    fault,
                });
                None
            }
            LinkAction::Disconnect => {
                if let Err(e) = peripheral.disconnect().await {
                    tracing::warn!("Disconnect from {} failed: {}", address, e);
                }
                None
            }
            LinkAction::Release => {
                if let Some(entry) = self.release(address) {
                    entry.close().await;
                }
                None
            }
        }
    }

    /// Remove a link from the connected set. The caller closes the entry.
    fn release(&self, address: &str) -> Option<LinkEntry> {
        let entry = lock(&self.links).remove(address);
        let removed = lock(&self.registry).mark_disconnected(address);

        if entry.is_some() || removed.is_some() {
            self.send_event(BleEvent::ConnectionChanged {
                address: address.to_string(),
                status: ConnectionStatus::Disconnected,
            });
        }

        entry
    }

    /// Start the notification pump and, if possible, the command writer.
    fn spawn_link_tasks(self: &Arc<Self>, address: &str) {
        let mut links = lock(&self.links);
        let Some(entry) = links.get_mut(address) else {
            return;
        };

        if entry.link.is_ready() {
            let shared = self.clone();
            let peripheral = entry.peripheral.clone();
            let address = address.to_string();
            entry.tasks.push(tokio::spawn(async move {
                shared.pump_notifications(peripheral, address).await;
            }));
        }

        let write_characteristic = entry.link.write_characteristic().and_then(|uuid| {
            entry
                .peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == uuid)
        });

        if let Some(characteristic) = write_characteristic {
            let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
            entry.writer = Some(tx);

            let shared = self.clone();
            let peripheral = entry.peripheral.clone();
            let address = address.to_string();
            entry.tasks.push(tokio::spawn(async move {
                while let Some(command) = rx.recv().await {
                    let result = peripheral
                        .write(&characteristic, &command.to_bytes(), WriteType::WithResponse)
                        .await;
                    match result {
                        Ok(()) => tracing::debug!("Sent {} to {}", command, address),
                        Err(e) => {
                            let error = BleError::WriteFailed(e.to_string());
                            tracing::error!("Sending {} to {} failed: {}", command, address, error);
                            shared.send_event(BleEvent::Error(error.to_string()));
                            shared
                                .drive(
                                    &peripheral,
                                    &address,
                                    LinkEvent::GattError {
                                        reason: error.to_string(),
                                    },
                                )
                                .await;
                            break;
                        }
                    }
                }
            }));
        }
    }

    /// Forward raw notification payloads until the link goes down.
    async fn pump_notifications(&self, peripheral: Peripheral, address: String) {
        use futures::stream::StreamExt;

        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to get notification stream: {}", e);
                return;
            }
        };

        while let Some(notification) = stream.next().await {
            if notification.uuid != HARNESS_NOTIFY_UUID {
                continue;
            }
            tracing::trace!("{} bytes from {}", notification.value.len(), address);
            self.send_event(BleEvent::Notification {
                address: address.clone(),
                payload: notification.value,
            });
        }

        // Stream ended - peripheral disconnected
        self.drive(&peripheral, &address, LinkEvent::Disconnected).await;
    }

    /// Process advertisement events for the scan started as `generation`.
    async fn process_discovery_events(&self, adapter: Adapter, generation: u64) {
        use futures::stream::StreamExt;

        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            if !lock(&self.registry).is_current_scan(generation) {
                break;
            }

            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };

            let Ok(peripheral) = adapter.peripheral(&id).await else {
                continue;
            };
            let Some(info) = self.classify_peripheral(&peripheral).await else {
                continue;
            };

            let added = lock(&self.registry).record_advertisement(info.clone());
            if added {
                tracing::debug!("Discovered {} ({})", info.display_name(), info.address);
                let reported = if self.permissions.can_connect() {
                    info
                } else {
                    info.redacted()
                };
                self.send_event(BleEvent::Discovered(reported));
            }
        }
    }

    /// Build peripheral info from advertisement properties.
    async fn classify_peripheral(&self, peripheral: &Peripheral) -> Option<PeripheralInfo> {
        let properties = peripheral.properties().await.ok()??;
        let name = properties.local_name?;

        if !matches_name_filter(Some(&name), self.config.name_filter.as_deref()) {
            return None;
        }

        Some(PeripheralInfo {
            address: peripheral.id().to_string(),
            name: Some(name),
            status: ConnectionStatus::Disconnected,
            signal_strength: properties.rssi,
            advertises_harness: properties.services.contains(&HARNESS_SERVICE_UUID),
            last_seen: Instant::now(),
        })
    }
}

/// Map btleplug's discovered services onto the link's view of them.
fn describe_services(peripheral: &Peripheral) -> Vec<DiscoveredService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| DiscoveredService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| DiscoveredCharacteristic {
                    uuid: c.uuid,
                    can_notify: c
                        .properties
                        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                    can_write: c
                        .properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
                })
                .collect(),
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
