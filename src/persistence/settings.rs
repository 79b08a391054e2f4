//! Application settings loaded from `settings.toml`.
//!
//! Unlike the [`ConfigStore`](super::config_store::ConfigStore), which holds
//! values the device learns at runtime, settings are tuning knobs written by
//! whoever deploys the device. Every field has a default so a partial file, or
//! none at all, still yields a working configuration.

use crate::wifi::MAX_RETRY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const SETTINGS_FILE: &str = "settings.toml";
const CONFIG_DIR: &str = ".config/lightlink";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub wifi: WifiSettings,
    pub discovery: DiscoverySettings,
    pub mqtt: MqttSettings,
    pub device: DeviceSettings,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WifiSettings {
    /// Reconnect attempts allowed in run mode before giving up.
    pub max_retry: u32,
    pub blink_period_ms: u64,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            max_retry: MAX_RETRY,
            blink_period_ms: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    pub service_type: String,
    pub timeout_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            service_type: "_mqtt._tcp.local.".to_string(),
            timeout_secs: 5,
        }
    }
}

impl DiscoverySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttSettings {
    pub keepalive_secs: u64,
    /// Upper bound for the connection test. The run flow waits forever.
    pub connect_timeout_secs: u64,
    pub blink_period_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            keepalive_secs: 5,
            connect_timeout_secs: 10,
            blink_period_ms: 300,
        }
    }
}

impl MqttSettings {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Number of LEDs announced when registering the strip.
    pub led_count: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self { led_count: 30 }
    }
}

impl Settings {
    /// Reads `settings.toml` from `dir`, falling back to defaults when absent.
    pub fn load(dir: &Path) -> Result<Self, SettingsError> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            warn!("Settings file {} missing, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| SettingsError::Io {
            path: path.clone(),
            source,
        })?;
        let settings = toml::from_str(&content)?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Seeds `dir` with a default settings file if there is none yet.
    pub fn ensure_default(dir: &Path) -> Result<(), SettingsError> {
        let path = dir.join(SETTINGS_FILE);
        if path.exists() {
            return Ok(());
        }

        info!("Creating default settings at {}", path.display());
        std::fs::create_dir_all(dir).map_err(|source| SettingsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let content = toml::to_string_pretty(&Settings::default())?;
        std::fs::write(&path, content).map_err(|source| SettingsError::Io { path, source })
    }
}

/// `~/.config/lightlink`, or `./.config/lightlink` when no home is known.
pub fn default_config_dir() -> PathBuf {
    let mut base = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    base.push(CONFIG_DIR);
    base
}
