//! Shared types for the BLE harness link.

use crate::sensors::link::{LinkFault, LinkState};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Name shown for peripherals whose name is missing or redacted.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// Externally visible connection status of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection or GATT setup in progress
    Connecting,
    /// Link up
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting..."),
            ConnectionStatus::Connected => write!(f, "Connected"),
        }
    }
}

/// A discovered or connected BLE peripheral.
#[derive(Debug, Clone)]
pub struct PeripheralInfo {
    /// BLE device address/identifier
    pub address: String,
    /// Advertised name, `None` when absent or redacted
    pub name: Option<String>,
    /// Current connection status
    pub status: ConnectionStatus,
    /// Signal strength (RSSI)
    pub signal_strength: Option<i16>,
    /// Whether the advertisement lists the harness service
    pub advertises_harness: bool,
    /// When the peripheral was last seen or updated
    pub last_seen: Instant,
}

impl PeripheralInfo {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
            status: ConnectionStatus::Disconnected,
            signal_strength: None,
            advertises_harness: false,
            last_seen: Instant::now(),
        }
    }

    /// Name suitable for display.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }

    /// Whether to pick this peripheral when connecting without user choice.
    ///
    /// Listed peripherals already matched `name_filter` when one is set;
    /// without a filter only those advertising the harness service qualify.
    pub fn is_harness_candidate(&self, name_filter: Option<&str>) -> bool {
        self.advertises_harness || name_filter.is_some()
    }

    /// Copy of this peripheral with the name removed.
    pub fn redacted(&self) -> Self {
        Self {
            name: None,
            ..self.clone()
        }
    }
}

/// Events from the BLE link layer.
#[derive(Debug, Clone)]
pub enum BleEvent {
    /// A new named peripheral was seen during scanning
    Discovered(PeripheralInfo),
    /// Peripheral connection status changed
    ConnectionChanged {
        address: String,
        status: ConnectionStatus,
    },
    /// Internal link state advanced
    LinkStateChanged { address: String, state: LinkState },
    /// The link is up but cannot be used as a harness
    LinkFault { address: String, fault: LinkFault },
    /// Raw notification payload from the harness notify characteristic
    Notification { address: String, payload: Vec<u8> },
    /// Scan started
    ScanStarted,
    /// Scan stopped (manually or by timeout)
    ScanStopped,
    /// Error occurred
    Error(String),
}

/// Configuration for the BLE controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Scan stops by itself after this many seconds
    pub scan_timeout_secs: u64,
    /// Timeout for a single connection attempt in seconds
    pub connect_timeout_secs: u64,
    /// ATT MTU to request once connected
    pub preferred_mtu: u16,
    /// Only list peripherals whose name contains this text
    pub name_filter: Option<String>,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            connect_timeout_secs: 10,
            preferred_mtu: crate::sensors::protocol::PREFERRED_MTU,
            name_filter: None,
        }
    }
}

/// Errors that can occur on the BLE link.
#[derive(Debug, Error)]
pub enum BleError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Runtime permission for the operation is missing
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// No peripheral with the given address
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),

    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt timed out
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// A GATT operation reported an error status
    #[error("GATT error: {0}")]
    Gatt(String),

    /// The peripheral does not expose the harness service
    #[error("Harness service not found on {0}")]
    ServiceMissing(String),

    /// The write characteristic is missing; commands are disabled
    #[error("Write characteristic not available on {0}")]
    WriteUnavailable(String),

    /// The peripheral is not connected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Failed to write to the command characteristic
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Failed to start or stop scanning
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// Generic BLE error
    #[error("BLE error: {0}")]
    Transport(String),
}

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        BleError::Transport(e.to_string())
    }
}
