//! Application configuration.
//!
//! Loaded from `config.toml` in the platform data directory. A missing file
//! yields defaults; missing sections or keys fall back to their defaults too.

use crate::measurement::types::{SessionConfig, SessionOwner};
use crate::sensors::types::BleConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application version
    pub version: String,
    /// Data directory path
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// BLE scan and connection settings
    pub ble: BleConfig,
    /// Measurement session settings
    pub session: SessionConfig,
    /// Storage settings
    pub storage: StorageSettings,
    /// Who recorded sessions belong to
    pub owner: OwnerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::new(),
            ble: BleConfig::default(),
            session: SessionConfig::default(),
            storage: StorageSettings::default(),
            owner: OwnerSettings::default(),
        }
    }
}

impl AppConfig {
    /// Absolute path of the session database.
    pub fn database_path(&self) -> PathBuf {
        if self.storage.database_file.is_absolute() {
            self.storage.database_file.clone()
        } else {
            self.data_dir.join(&self.storage.database_file)
        }
    }
}

/// Storage-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Session database, relative to the data directory unless absolute
    pub database_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_file: PathBuf::from("sessions.db"),
        }
    }
}

/// Session ownership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerSettings {
    pub user_id: String,
    pub athlete_id: String,
    pub user_email: Option<String>,
}

impl Default for OwnerSettings {
    fn default() -> Self {
        Self {
            user_id: "local".to_string(),
            athlete_id: "default".to_string(),
            user_email: None,
        }
    }
}

impl OwnerSettings {
    pub fn to_owner(&self) -> SessionOwner {
        SessionOwner {
            user_id: self.user_id.clone(),
            athlete_id: self.athlete_id.clone(),
            user_email: self.user_email.clone(),
        }
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "liftlink", "LiftLink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load application configuration from the default location.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut config = load_config_from(&get_config_path())?;
    config.data_dir = get_data_dir();
    Ok(config)
}

/// Load configuration from `path`; a missing file yields defaults.
///
/// The data directory is set to the file's parent directory.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let data_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    if !path.exists() {
        return Ok(AppConfig {
            data_dir,
            ..Default::default()
        });
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let mut config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.data_dir = data_dir;
    Ok(config)
}

/// Save application configuration to the default location.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

/// Save application configuration to `path`.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}
