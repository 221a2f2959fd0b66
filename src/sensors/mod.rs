//! BLE link to the sensor harness master unit.

pub mod command;
pub mod link;
pub mod manager;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod types;

pub use command::{CommandLink, RecordingCommandLink};
pub use link::{
    DiscoveredCharacteristic, DiscoveredService, Link, LinkAction, LinkEvent, LinkFault, LinkState,
};
pub use manager::BleController;
pub use permissions::{GrantAll, PermissionProvider, StaticPermissions};
pub use protocol::Command;
pub use registry::{PeripheralRegistry, RegistrySnapshot};
pub use types::{BleConfig, BleError, BleEvent, ConnectionStatus, PeripheralInfo};
