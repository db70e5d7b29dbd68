use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::gid::DEFAULT_GID_TABLE_LEN;
use crate::mr::MAX_MR_CNT;
use crate::qp::MAX_QP_CNT;
use crate::Error;

/// Limits and defaults of every device a registry attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub gid_table_len: usize,
    pub max_pd: usize,
    pub max_cq: usize,
    pub max_cqe: u32,
    /// Number of QPN slots, slot 0 is reserved.
    pub max_qp: usize,
    pub max_qp_wr: u32,
    pub max_sge: u32,
    pub max_inline_data: u32,
    pub max_mr: usize,
    pub max_qp_rd_atom: u8,
    pub default_pkey: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            gid_table_len: DEFAULT_GID_TABLE_LEN,
            max_pd: 1024,
            max_cq: 1024,
            max_cqe: 65536,
            max_qp: MAX_QP_CNT,
            max_qp_wr: 4096,
            max_sge: 16,
            max_inline_data: 256,
            max_mr: MAX_MR_CNT,
            max_qp_rd_atom: 16,
            default_pkey: 1,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidArgument(format!("device config: {}", what)))
            }
        };
        check(self.gid_table_len > 0, "gid_table_len must be positive")?;
        check(self.max_pd > 0, "max_pd must be positive")?;
        check(self.max_cq > 0, "max_cq must be positive")?;
        check(self.max_cqe > 0, "max_cqe must be positive")?;
        check(
            self.max_qp > 1 && self.max_qp <= MAX_QP_CNT,
            "max_qp must be in (1, 1024]",
        )?;
        check(
            self.max_mr > 0 && self.max_mr <= MAX_MR_CNT,
            "max_mr must be in (0, 4096]",
        )?;
        check(self.max_qp_wr > 0, "max_qp_wr must be positive")?;
        check(self.max_sge > 0, "max_sge must be positive")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub device: DeviceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_owned(),
            device: DeviceConfig::default(),
        }
    }
}

impl Config {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = match config {
            Some(s) => toml::from_str(s)?,
            None => Config::default(),
        };
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}
