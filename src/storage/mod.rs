//! Storage module for configuration and saved sessions.

pub mod config;
pub mod schema;
pub mod session_store;

pub use config::{AppConfig, ConfigError, OwnerSettings, StorageSettings};
pub use session_store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoreError};
