//! LiftLink - angle-sensor harness link for weightlifting training
//!
//! Connects to a two-unit inertial sensor harness over BLE, streams angle
//! samples from both units through a measurement session, and stores the
//! finished sessions with the derived angle series.

pub mod measurement;
pub mod sensors;
pub mod storage;

// Re-export commonly used types
pub use measurement::controller::MeasurementController;
pub use sensors::manager::BleController;
pub use storage::config::AppConfig;
pub use storage::session_store::{SessionStore, SqliteSessionStore};
