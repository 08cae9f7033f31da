//! TOML platform configuration.
//!
//! One file describes the account and every door the runner should
//! manage. Cloud devices need the account credentials; local devices
//! need a host and the device key instead.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use garadex_core::defaults;

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Cloud,
    Local,
}

/// Per-door options.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceOptions {
    /// Hardware uuid of the device.
    pub uuid: String,
    /// Display name used in logs and events. Defaults to the uuid.
    #[serde(default)]
    pub name: Option<String>,
    pub connection: ConnectionKind,
    /// Seconds a full open is expected to take.
    #[serde(default = "default_operation_time")]
    pub operation_time: u64,
    /// Local connection only: device IP or hostname.
    #[serde(default)]
    pub host: Option<String>,
    /// Local connection only: the device's account key.
    #[serde(default)]
    pub key: Option<String>,
}

impl DeviceOptions {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.uuid)
    }
}

/// Top-level platform configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Cloud account email. Required when any device uses the cloud.
    #[serde(default)]
    pub username: Option<String>,
    /// Cloud account password, plain or base64.
    #[serde(default)]
    pub password: Option<String>,
    /// Poll interval in seconds for locally connected devices.
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u64,
    /// Poll interval in seconds for cloud connected devices. Pushes carry
    /// most updates there, so this is a slow safety net.
    #[serde(default = "default_cloud_refresh_rate")]
    pub cloud_refresh_rate: u64,
    #[serde(default)]
    pub devices: Vec<DeviceOptions>,
}

fn default_operation_time() -> u64 {
    defaults::OPERATION_TIME_SECS
}

fn default_refresh_rate() -> u64 {
    defaults::REFRESH_RATE_SECS
}

fn default_cloud_refresh_rate() -> u64 {
    defaults::CLOUD_REFRESH_RATE_SECS
}

impl PlatformConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn needs_cloud(&self) -> bool {
        self.devices
            .iter()
            .any(|d| d.connection == ConnectionKind::Cloud)
    }

    fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            bail!("no devices configured");
        }
        if self.needs_cloud() && (self.username.is_none() || self.password.is_none()) {
            bail!("cloud devices are configured but username/password are missing");
        }
        for device in &self.devices {
            if device.connection == ConnectionKind::Local {
                if device.host.is_none() {
                    bail!("local device {} is missing its host", device.uuid);
                }
                if device.key.is_none() {
                    bail!("local device {} is missing its key", device.uuid);
                }
            }
        }
        Ok(())
    }
}
