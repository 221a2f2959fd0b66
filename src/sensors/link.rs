//! Connection state machine for a single harness peripheral.
//!
//! The machine is driven purely by [`LinkEvent`] values. Each call to
//! [`Link::handle`] applies one transition and returns the [`LinkAction`]s the
//! transport has to perform next; the completion of each action is fed back as
//! another event. No I/O happens here, so every transition can be exercised
//! without a radio.

use crate::sensors::protocol::{DEFAULT_MTU, HARNESS_NOTIFY_UUID, HARNESS_SERVICE_UUID, HARNESS_WRITE_UUID};
use crate::sensors::types::ConnectionStatus;
use uuid::Uuid;

/// Internal state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No link, native handle released
    #[default]
    Disconnected,
    /// Connect issued, waiting for the transport
    Connecting,
    /// Link up; negotiating MTU, discovering services and enabling notifications
    ServiceDiscovery,
    /// Notifications enabled, samples may flow
    Ready,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::ServiceDiscovery => write!(f, "Service discovery"),
            LinkState::Ready => write!(f, "Ready"),
        }
    }
}

/// Problems that leave the link up but limit what it can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Harness service absent; the peripheral is unusable
    ServiceMissing,
    /// Notify characteristic absent; no samples can be received
    NotifyMissing,
    /// Write characteristic absent; commands are disabled
    WriteMissing,
}

impl LinkFault {
    /// Whether the fault prevents receiving data.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkFault::WriteMissing)
    }
}

impl std::fmt::Display for LinkFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFault::ServiceMissing => write!(f, "harness service not found"),
            LinkFault::NotifyMissing => write!(f, "notify characteristic not found"),
            LinkFault::WriteMissing => write!(f, "write characteristic not found"),
        }
    }
}

/// A characteristic reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub can_notify: bool,
    pub can_write: bool,
}

/// A service reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

impl DiscoveredService {
    fn characteristic(&self, uuid: Uuid) -> Option<&DiscoveredCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Inputs to the link state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Caller asked to connect
    ConnectRequested,
    /// Transport reports the link is up
    Connected,
    /// MTU exchange finished; `None` when the platform negotiates on its own
    MtuNegotiated { mtu: Option<u16> },
    /// Service discovery finished
    ServicesDiscovered(Vec<DiscoveredService>),
    /// Notification-enable descriptor write finished
    DescriptorWritten { success: bool },
    /// Any GATT operation failed
    GattError { reason: String },
    /// Caller asked to disconnect
    DisconnectRequested,
    /// Transport reports the link went down
    Disconnected,
}

/// Work the transport must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Open the connection
    Connect,
    /// Request a larger ATT MTU
    RequestMtu(u16),
    /// Discover services and characteristics
    DiscoverServices,
    /// Subscribe to the notify characteristic
    EnableNotifications { characteristic: Uuid },
    /// Surface a non-transport problem to observers
    ReportFault(LinkFault),
    /// Close the connection
    Disconnect,
    /// Release the native handle and drop the peripheral from the connected set
    Release,
}

/// State machine for one peripheral connection.
#[derive(Debug, Clone)]
pub struct Link {
    address: String,
    state: LinkState,
    preferred_mtu: Option<u16>,
    awaiting_mtu: bool,
    mtu: u16,
    notify_characteristic: Option<Uuid>,
    write_characteristic: Option<Uuid>,
    fault: Option<LinkFault>,
}

impl Link {
    /// Create a link. `preferred_mtu` of `None` skips MTU negotiation.
    pub fn new(address: impl Into<String>, preferred_mtu: Option<u16>) -> Self {
        Self {
            address: address.into(),
            state: LinkState::Disconnected,
            preferred_mtu: preferred_mtu.filter(|mtu| *mtu > DEFAULT_MTU),
            awaiting_mtu: false,
            mtu: DEFAULT_MTU,
            notify_characteristic: None,
            write_characteristic: None,
            fault: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// The most severe fault seen since the link came up.
    pub fn fault(&self) -> Option<LinkFault> {
        self.fault
    }

    pub fn notify_characteristic(&self) -> Option<Uuid> {
        self.notify_characteristic
    }

    pub fn write_characteristic(&self) -> Option<Uuid> {
        self.write_characteristic
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Whether commands can be written on this link.
    pub fn can_send_commands(&self) -> bool {
        self.state != LinkState::Disconnected && self.write_characteristic.is_some()
    }

    /// Status shown to observers. The peripheral counts as connected as soon
    /// as the transport link is up.
    pub fn connection_status(&self) -> ConnectionStatus {
        match self.state {
            LinkState::Disconnected => ConnectionStatus::Disconnected,
            LinkState::Connecting => ConnectionStatus::Connecting,
            LinkState::ServiceDiscovery | LinkState::Ready => ConnectionStatus::Connected,
        }
    }

    /// Apply one event and return the follow-up actions.
    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        let before = self.state;
        let actions = match (self.state, event) {
            (LinkState::Disconnected, LinkEvent::ConnectRequested) => {
                self.reset();
                self.state = LinkState::Connecting;
                vec![LinkAction::Connect]
            }
            (_, LinkEvent::ConnectRequested) => Vec::new(),

            (LinkState::Connecting, LinkEvent::Connected) => {
                self.state = LinkState::ServiceDiscovery;
                match self.preferred_mtu {
                    Some(mtu) => {
                        self.awaiting_mtu = true;
                        vec![LinkAction::RequestMtu(mtu)]
                    }
                    None => vec![LinkAction::DiscoverServices],
                }
            }

            (LinkState::ServiceDiscovery, LinkEvent::MtuNegotiated { mtu }) if self.awaiting_mtu => {
                self.awaiting_mtu = false;
                if let Some(mtu) = mtu {
                    self.mtu = mtu.max(DEFAULT_MTU);
                }
                vec![LinkAction::DiscoverServices]
            }

            (LinkState::ServiceDiscovery, LinkEvent::ServicesDiscovered(services)) => {
                self.on_services_discovered(&services)
            }

            (LinkState::ServiceDiscovery, LinkEvent::DescriptorWritten { success: true })
                if self.notify_characteristic.is_some() =>
            {
                self.state = LinkState::Ready;
                Vec::new()
            }

            (LinkState::Disconnected, LinkEvent::GattError { .. })
            | (LinkState::Disconnected, LinkEvent::Disconnected)
            | (LinkState::Disconnected, LinkEvent::DisconnectRequested)
            | (LinkState::Disconnected, LinkEvent::DescriptorWritten { .. }) => Vec::new(),

            (_, LinkEvent::DescriptorWritten { success: false }) => {
                tracing::error!("Enabling notifications failed on {}", self.address);
                self.teardown(false)
            }

            (_, LinkEvent::GattError { reason }) => {
                tracing::error!("GATT error on {}: {}", self.address, reason);
                self.teardown(false)
            }

            (_, LinkEvent::Disconnected) => {
                tracing::info!("Link to {} went down", self.address);
                self.teardown(false)
            }

            (_, LinkEvent::DisconnectRequested) => self.teardown(true),

            (state, event) => {
                tracing::debug!("Ignoring {:?} on {} in state {}", event, self.address, state);
                Vec::new()
            }
        };

        if self.state != before {
            tracing::debug!("Link {}: {} -> {}", self.address, before, self.state);
        }

        actions
    }

    fn on_services_discovered(&mut self, services: &[DiscoveredService]) -> Vec<LinkAction> {
        let Some(service) = services.iter().find(|s| s.uuid == HARNESS_SERVICE_UUID) else {
            tracing::error!("Harness service {} not found on {}", HARNESS_SERVICE_UUID, self.address);
            self.fault = Some(LinkFault::ServiceMissing);
            return vec![LinkAction::ReportFault(LinkFault::ServiceMissing)];
        };

        let mut actions = Vec::new();

        self.write_characteristic = service
            .characteristic(HARNESS_WRITE_UUID)
            .filter(|c| c.can_write)
            .map(|c| c.uuid);
        if self.write_characteristic.is_none() {
            tracing::warn!("Write characteristic missing on {}, commands disabled", self.address);
            self.fault.get_or_insert(LinkFault::WriteMissing);
            actions.push(LinkAction::ReportFault(LinkFault::WriteMissing));
        }

        match service.characteristic(HARNESS_NOTIFY_UUID).filter(|c| c.can_notify) {
            Some(c) => {
                self.notify_characteristic = Some(c.uuid);
                actions.push(LinkAction::EnableNotifications {
                    characteristic: c.uuid,
                });
            }
            None => {
                tracing::error!("Notify characteristic missing on {}", self.address);
                self.fault = Some(LinkFault::NotifyMissing);
                actions.push(LinkAction::ReportFault(LinkFault::NotifyMissing));
            }
        }

        actions
    }

    fn teardown(&mut self, local: bool) -> Vec<LinkAction> {
        self.state = LinkState::Disconnected;
        self.reset();
        if local {
            vec![LinkAction::Disconnect, LinkAction::Release]
        } else {
            vec![LinkAction::Release]
        }
    }

    fn reset(&mut self) {
        self.awaiting_mtu = false;
        self.mtu = DEFAULT_MTU;
        self.notify_characteristic = None;
        self.write_characteristic = None;
        self.fault = None;
    }
}
