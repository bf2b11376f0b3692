//! Bridge configuration
//!
//! Loaded once at startup from TOML, then overridden field by field from the
//! command line or environment. The result is immutable and shared via `Arc`.
//!
//! ```toml
//! [device]
//! device_id = "bf00000000000000000000"
//! device_ip = "192.168.1.50"
//! local_key = "0123456789abcdef"
//!
//! [mqtt]
//! host = "broker.local"
//! topic = "moebot"
//!
//! [bridge]
//! poll_interval_secs = 30
//! offline_policy = "queue"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::ClientSettings;
use crate::mqtt::MqttConfig;
use crate::protocol::{DeviceIdentity, DEVICE_PORT, KEY_LEN};

const APP_DIR: &str = "moebot-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid device address {0:?}")]
    InvalidAddress(String),

    #[error("Local key must be exactly {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub device_id: String,
    pub device_ip: String,
    pub local_key: String,
    pub port: Option<u16>,
}

impl fmt::Debug for DeviceSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSection")
            .field("device_id", &self.device_id)
            .field("device_ip", &self.device_ip)
            .field("local_key", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub poll_interval_secs: u64,
    #[serde(flatten)]
    pub client: ClientSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            client: ClientSettings::default(),
        }
    }
}

impl BridgeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Values from the command line or environment. Each one that is set wins
/// over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub device_id: Option<String>,
    pub device_ip: Option<String>,
    pub local_key: Option<String>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device: DeviceSection,
    pub mqtt: MqttConfig,
    pub bridge: BridgeSettings,
}

impl BridgeConfig {
    /// `~/.config/moebot-bridge/config.toml`, or the platform equivalent.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                warn!("Could not determine config directory, using current directory");
                PathBuf::from(".")
            })
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Reads `path` (or the default location), applies `overrides` and
    /// validates the result. A missing file means defaults.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Arc<Self>, ConfigError> {
        let explicit = path.is_some();
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => {
                info!("Loading configuration from {}", path.display());
                toml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                debug!("No configuration at {}, using defaults", path.display());
                BridgeConfig::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        config.apply(overrides);
        config.validate()?;
        Ok(Arc::new(config))
    }

    fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            device_id,
            device_ip,
            local_key,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic,
        } = overrides;

        if let Some(v) = device_id {
            self.device.device_id = v;
        }
        if let Some(v) = device_ip {
            self.device.device_ip = v;
        }
        if let Some(v) = local_key {
            self.device.local_key = v;
        }
        if let Some(v) = mqtt_host {
            self.mqtt.host = v;
        }
        if let Some(v) = mqtt_port {
            self.mqtt.port = v;
        }
        if mqtt_username.is_some() {
            self.mqtt.username = mqtt_username;
        }
        if mqtt_password.is_some() {
            self.mqtt.password = mqtt_password;
        }
        if let Some(v) = mqtt_topic {
            self.mqtt.topic = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.device_id.trim().is_empty() {
            return Err(ConfigError::Missing("device_id"));
        }
        if self.device.device_ip.trim().is_empty() {
            return Err(ConfigError::Missing("device_ip"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt host"));
        }
        self.address()?;
        self.local_key()?;
        Ok(())
    }

    fn address(&self) -> Result<IpAddr, ConfigError> {
        let raw = self.device.device_ip.trim();
        raw.parse()
            .map_err(|_| ConfigError::InvalidAddress(raw.to_string()))
    }

    fn local_key(&self) -> Result<[u8; KEY_LEN], ConfigError> {
        let bytes = self.device.local_key.as_bytes();
        bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidKeyLength(bytes.len()))
    }

    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        Ok(DeviceIdentity::new(
            self.device.device_id.trim().to_string(),
            self.address()?,
            self.device.port.unwrap_or(DEVICE_PORT),
            self.local_key()?,
        ))
    }
}
