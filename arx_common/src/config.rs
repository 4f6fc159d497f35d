//! Firmware configuration loading.
//!
//! Boot-time settings (serial link, tick rate, storage path, log level)
//! come from a TOML file loaded through the [`ConfigLoader`] trait. The
//! per-joint motion tunables are *not* here — they live in nonvolatile
//! storage and are managed by the firmware's config store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consts::{DEFAULT_BAUD, DEFAULT_TICK_HZ};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Logging verbosity level (lowercase in TOML).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive understood by the tracing subscriber.
    pub const fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Host serial link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path.
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_device() -> String {
    "/dev/ttyAMA0".to_string()
}
fn default_baud() -> u32 {
    DEFAULT_BAUD
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

/// Top-level firmware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Logging verbosity.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Host link.
    #[serde(default)]
    pub serial: SerialConfig,
    /// Step-engine tick rate [Hz].
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Backing file for the nonvolatile storage image.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

fn default_tick_hz() -> u32 {
    DEFAULT_TICK_HZ
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("arx-nvs.bin")
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            serial: SerialConfig::default(),
            tick_hz: default_tick_hz(),
            storage_path: default_storage_path(),
        }
    }
}

impl FirmwareConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` for a zero tick rate, a tick
    /// rate the pulse timing cannot sustain, or an empty serial device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.device.is_empty() {
            return Err(ConfigError::ValidationError(
                "serial.device cannot be empty".to_string(),
            ));
        }
        if self.tick_hz == 0 {
            return Err(ConfigError::ValidationError(
                "tick_hz must be positive".to_string(),
            ));
        }
        if self.tick_hz > 100_000 {
            return Err(ConfigError::ValidationError(format!(
                "tick_hz {} exceeds the 100 kHz pulse-width ceiling",
                self.tick_hz
            )));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `DeserializeOwned` type.
///
/// # Contract
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let cfg = FirmwareConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.serial.baud, DEFAULT_BAUD);
        assert_eq!(cfg.tick_hz, DEFAULT_TICK_HZ);
    }

    #[test]
    fn load_full_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"log_level = "debug"
tick_hz = 15000
storage_path = "/var/lib/arx/nvs.bin"

[serial]
device = "/dev/ttyUSB0"
baud = 460800
"#
        )
        .unwrap();
        file.flush().unwrap();

        let cfg = FirmwareConfig::load(file.path()).unwrap();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.tick_hz, 15000);
        assert_eq!(cfg.serial.device, "/dev/ttyUSB0");
        assert_eq!(cfg.serial.baud, 460800);
    }

    #[test]
    fn missing_file_is_reported() {
        let result = FirmwareConfig::load(Path::new("/nonexistent/arx.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn parse_error_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml {{{{").unwrap();
        let result = FirmwareConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn validation_rejects_excessive_tick_rate() {
        let cfg = FirmwareConfig {
            tick_hz: 500_000,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
