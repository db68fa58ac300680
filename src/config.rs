//! # Configuration Management Module
//!
//! Persistent settings stored in platform-appropriate locations.
//! Handles loading, saving, validating and providing defaults.
//!
//! ## Settings
//! - `target_device_name`: Case-insensitive substring of the advertised name to attach to
//! - `notify_characteristic`: Characteristic carrying heart rate notifications
//! - `buffer_capacity`: Samples buffered before an automatic flush
//! - `scan_timeout_secs`: How long discovery may run before giving up
//! - `max_pending_batches`: Failed batches kept for retry before the oldest is dropped
//! - `database_path`: SQLite file receiving the readings
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/pulse-ingest/config.toml
//! - Linux: ~/.config/pulse-ingest/config.toml
//! - Windows: %APPDATA%\pulse-ingest\config.toml

use crate::connection::LinkSettings;
use crate::error::ConfigError;
use crate::transport::HEART_RATE_MEASUREMENT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const APP_DIR: &str = "pulse-ingest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target_device_name: String,
    pub notify_characteristic: Uuid,
    pub buffer_capacity: usize,
    pub scan_timeout_secs: u64,
    pub max_pending_batches: usize,
    pub database_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_device_name: "Polar Verity Sense".to_string(),
            notify_characteristic: HEART_RATE_MEASUREMENT,
            buffer_capacity: 100,
            scan_timeout_secs: 10,
            max_pending_batches: 16,
            database_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("heart_rate.db"),
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load config from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Load config from `path`, writing the defaults there if the file is missing
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config: Config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(ConfigError::ParseFailed)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", path.display());
                let config = Self::default();
                config.save_to(path)?;
                config
            }
            Err(e) => return Err(ConfigError::ReadFailed(e)),
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_path())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_device_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "target_device_name must not be empty".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.scan_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scan_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_pending_batches == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_batches must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.buffer_capacity).ok_or_else(|| {
            ConfigError::Invalid("buffer_capacity must be greater than zero".to_string())
        })
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            target_name: self.target_device_name.clone(),
            characteristic: self.notify_characteristic,
            scan_timeout: self.scan_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.target_device_name, "Polar Verity Sense");
        assert_eq!(config.buffer_capacity, 100);
        assert_eq!(
            config.notify_characteristic.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            buffer_capacity: 25,
            ..Config::default()
        };

        let toml_str = toml::to_string(&config).expect("Failed to serialize");
        assert!(toml_str.contains("buffer_capacity = 25"));
        assert!(toml_str.contains("notify_characteristic = \"00002a37-0000-1000-8000-00805f9b34fb\""));
    }

    #[test]
    fn test_config_deserialization_fills_defaults() {
        let toml_str = r#"
            target_device_name = "Polar H10"
            scan_timeout_secs = 30
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.target_device_name, "Polar H10");
        assert_eq!(config.scan_timeout(), Duration::from_secs(30));
        assert_eq!(config.buffer_capacity, 100);
        assert_eq!(config.notify_characteristic, HEART_RATE_MEASUREMENT);
    }

    #[test]
    fn test_load_from_creates_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pulse").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            target_device_name: "Verity".to_string(),
            buffer_capacity: 5,
            database_path: dir.path().join("hr.db"),
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "buffer_capacity = 0\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        let config = Config {
            scan_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config {
            buffer_capacity: 0,
            ..Config::default()
        }
        .capacity()
        .is_err());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "buffer_capacity = \"many\"\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseFailed(_))
        ));
    }
}
