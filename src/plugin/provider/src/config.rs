use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use bluerdma::api::gid::MacAddr;
use bluerdma::backend::loopback::LOOPBACK;
use bluerdma::config::{Config, DeviceConfig};
use bluerdma::netdev::DEFAULT_MTU;

/// A network device the provider attaches at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceDescriptor {
    pub netdev: String,
    /// Defaults to `02:bd:bd:00:00:<position + 1>`.
    #[serde(default)]
    pub hw_addr: Option<MacAddr>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Defaults to the provider's `default_backend`.
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default = "default_link_up")]
    pub link_up: bool,
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_link_up() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub log_level: String,
    pub default_backend: String,
    pub device: DeviceConfig,
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            log_level: "info".to_owned(),
            default_backend: LOOPBACK.to_owned(),
            device: DeviceConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = match config {
            Some(s) => toml::from_str(s)?,
            None => ProviderConfig::default(),
        };
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The part of the configuration the verbs core reads.
    pub fn core(&self) -> Config {
        Config {
            log_level: self.log_level.clone(),
            device: self.device.clone(),
        }
    }
}
