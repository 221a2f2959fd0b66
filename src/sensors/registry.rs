//! Live view of scanned and connected peripherals.

use crate::sensors::types::{ConnectionStatus, PeripheralInfo};
use std::collections::HashMap;
use std::time::Instant;

/// Point-in-time copy of the registry for observers.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Peripherals seen during the current or last scan, in discovery order
    pub scanned: Vec<PeripheralInfo>,
    /// Connected peripherals, sorted by address
    pub connected: Vec<PeripheralInfo>,
    /// Whether a scan is running
    pub scanning: bool,
}

impl RegistrySnapshot {
    /// Copy with every peripheral name removed.
    pub fn redacted(&self) -> Self {
        Self {
            scanned: self.scanned.iter().map(PeripheralInfo::redacted).collect(),
            connected: self.connected.iter().map(PeripheralInfo::redacted).collect(),
            scanning: self.scanning,
        }
    }
}

/// Scanned/connected bookkeeping shared by the BLE controller.
#[derive(Debug, Default)]
pub struct PeripheralRegistry {
    scanned: Vec<PeripheralInfo>,
    connected: HashMap<String, PeripheralInfo>,
    scanning: bool,
    scan_generation: u64,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a scan as running and clear previous results.
    ///
    /// Returns the scan generation, or `None` if a scan is already running.
    pub fn begin_scan(&mut self) -> Option<u64> {
        if self.scanning {
            return None;
        }
        self.scanning = true;
        self.scanned.clear();
        self.scan_generation += 1;
        Some(self.scan_generation)
    }

    /// Mark the scan as stopped. Returns `false` if no scan was running.
    pub fn end_scan(&mut self) -> bool {
        std::mem::replace(&mut self.scanning, false)
    }

    /// End the scan only if it is still the one started as `generation`.
    pub fn end_scan_if(&mut self, generation: u64) -> bool {
        if self.is_current_scan(generation) {
            self.end_scan()
        } else {
            false
        }
    }

    /// Whether the scan started as `generation` is still running.
    pub fn is_current_scan(&self, generation: u64) -> bool {
        self.scanning && self.scan_generation == generation
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Record an advertisement. Unnamed peripherals are not listed.
    ///
    /// Returns `true` when the peripheral is new to this scan.
    pub fn record_advertisement(&mut self, info: PeripheralInfo) -> bool {
        if !self.scanning || info.name.is_none() {
            return false;
        }

        if let Some(existing) = self.scanned.iter_mut().find(|p| p.address == info.address) {
            existing.signal_strength = info.signal_strength.or(existing.signal_strength);
            existing.advertises_harness |= info.advertises_harness;
            existing.last_seen = info.last_seen;
            return false;
        }

        self.scanned.push(info);
        true
    }

    /// Add or update a connected peripheral.
    pub fn mark_connected(&mut self, mut info: PeripheralInfo) {
        info.status = ConnectionStatus::Connected;
        info.last_seen = Instant::now();
        self.set_scanned_status(&info.address, ConnectionStatus::Connected);
        self.connected.insert(info.address.clone(), info);
    }

    /// Reflect an in-progress connection attempt on the scan list.
    pub fn mark_connecting(&mut self, address: &str) {
        self.set_scanned_status(address, ConnectionStatus::Connecting);
    }

    /// Remove a peripheral from the connected set.
    pub fn mark_disconnected(&mut self, address: &str) -> Option<PeripheralInfo> {
        self.set_scanned_status(address, ConnectionStatus::Disconnected);
        self.connected.remove(address).map(|mut info| {
            info.status = ConnectionStatus::Disconnected;
            info
        })
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connected.contains_key(address)
    }

    /// Connected addresses, sorted.
    pub fn connected_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.connected.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Look up a peripheral by address, connected ones first.
    pub fn find(&self, address: &str) -> Option<&PeripheralInfo> {
        self.connected
            .get(address)
            .or_else(|| self.scanned.iter().find(|p| p.address == address))
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut connected: Vec<PeripheralInfo> = self.connected.values().cloned().collect();
        connected.sort_by(|a, b| a.address.cmp(&b.address));
        RegistrySnapshot {
            scanned: self.scanned.clone(),
            connected,
            scanning: self.scanning,
        }
    }

    fn set_scanned_status(&mut self, address: &str, status: ConnectionStatus) {
        if let Some(p) = self.scanned.iter_mut().find(|p| p.address == address) {
            p.status = status;
        }
    }
}

/// Case-insensitive substring match used for scan name filtering.
pub fn matches_name_filter(name: Option<&str>, filter: Option<&str>) -> bool {
    match (name, filter) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(name), Some(filter)) => name.to_lowercase().contains(&filter.to_lowercase()),
    }
}
