//! Command write path used by the measurement controller.

use crate::sensors::protocol::Command;
use crate::sensors::types::BleError;
use std::sync::Mutex;

/// Write side of the harness link.
///
/// Implementations must be callable from any thread while notifications are
/// being delivered on another.
pub trait CommandLink: Send + Sync {
    /// Addresses of currently connected peripherals, sorted.
    fn connected_addresses(&self) -> Vec<String>;

    /// Queue a command for the peripheral at `address`.
    fn send_command(&self, address: &str, command: Command) -> Result<(), BleError>;
}

/// In-memory [`CommandLink`] that records every command sent.
#[derive(Debug, Default)]
pub struct RecordingCommandLink {
    connected: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Command)>>,
    fail_writes: Mutex<bool>,
}

impl RecordingCommandLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link with the given peripherals already connected.
    pub fn with_connected(addresses: &[&str]) -> Self {
        let link = Self::new();
        for address in addresses {
            link.connect(address);
        }
        link
    }

    pub fn connect(&self, address: &str) {
        let mut connected = lock(&self.connected);
        if !connected.iter().any(|a| a == address) {
            connected.push(address.to_string());
            connected.sort();
        }
    }

    pub fn disconnect(&self, address: &str) {
        lock(&self.connected).retain(|a| a != address);
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }

    /// Commands sent so far, oldest first.
    pub fn sent(&self) -> Vec<(String, Command)> {
        lock(&self.sent).clone()
    }

    /// Just the command values sent so far.
    pub fn sent_commands(&self) -> Vec<Command> {
        lock(&self.sent).iter().map(|(_, c)| *c).collect()
    }
}

impl CommandLink for RecordingCommandLink {
    fn connected_addresses(&self) -> Vec<String> {
        lock(&self.connected).clone()
    }

    fn send_command(&self, address: &str, command: Command) -> Result<(), BleError> {
        if !lock(&self.connected).iter().any(|a| a == address) {
            return Err(BleError::NotConnected(address.to_string()));
        }
        if *lock(&self.fail_writes) {
            return Err(BleError::WriteFailed(format!("{} rejected", command)));
        }
        lock(&self.sent).push((address.to_string(), command));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
