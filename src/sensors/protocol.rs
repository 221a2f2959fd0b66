//! Wire protocol constants for the sensor harness master unit.
//!
//! The master unit exposes a UART-style GATT service with one notify
//! characteristic (device -> app) and one write characteristic (app -> device).
//! Commands are plain UTF-8 text; notifications carry JSON sample records and
//! bare control tokens.

use uuid::Uuid;

/// Harness service UUID.
pub const HARNESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Notify characteristic the master unit streams samples on.
pub const HARNESS_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Write characteristic that accepts text commands.
pub const HARNESS_WRITE_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// ATT MTU requested after connecting (BLE 5 maximum).
pub const PREFERRED_MTU: u16 = 517;

/// ATT MTU every link starts with.
pub const DEFAULT_MTU: u16 = 23;

/// Control token sent by the master unit after the last sample of a run.
pub const END_TOKEN: &str = "END";

/// Companion (secondary unit) reachable.
pub const SLAVE_OK_TOKEN: &str = "SLAVE_OK";

/// Companion (secondary unit) not responding.
pub const SLAVE_ERROR_TOKEN: &str = "SLAVE_ERROR";

/// Bare tokens the reassembler emits as soon as they are complete.
pub const CONTROL_TOKENS: [&str; 3] = [END_TOKEN, SLAVE_OK_TOKEN, SLAVE_ERROR_TOKEN];

/// Commands understood by the master unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Begin streaming samples
    Start,
    /// Stop streaming and emit the END token
    Stop,
    /// Ask the master whether the secondary unit answers
    CheckCompanion,
}

impl Command {
    /// Text sent on the write characteristic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::CheckCompanion => "CHECK_SLAVE",
        }
    }

    /// Encoded payload for the write characteristic.
    pub fn to_bytes(self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usable payload bytes per notification for a negotiated MTU.
pub fn payload_size(mtu: u16) -> usize {
    usize::from(mtu.max(DEFAULT_MTU)) - 3
}
