//! Configuration types for adblink.
//! Parsed from ~/.adblink/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::ConnectionOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdbConfig {
    #[serde(default)]
    pub keys: KeysSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub pairing: PairingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysSection {
    #[serde(default = "default_key_dir")]
    pub dir: String,
}

impl Default for KeysSection {
    fn default() -> Self {
        Self {
            dir: default_key_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enable_delayed_ack: bool,
    #[serde(default)]
    pub abort_on_unauthorised: bool,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            enable_delayed_ack: true,
            abort_on_unauthorised: false,
        }
    }
}

impl ConnectionSection {
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            enable_delayed_ack: self.enable_delayed_ack,
            abort_on_unauthorised: self.abort_on_unauthorised,
            connect_timeout: (self.connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.connect_timeout_secs)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingSection {
    /// Name attached to our public key on the device; empty uses the key name.
    #[serde(default)]
    pub device_name: String,
}

// Default value functions
fn default_key_dir() -> String {
    "~/.adblink".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

impl AdbConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AdbConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
