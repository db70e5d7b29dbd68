//! The Ethernet-side collaborator of a device: hardware address, link state and MTU.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bluerdma_api::gid::MacAddr;

use crate::{Error, Result};

pub const DEFAULT_MTU: u32 = 1500;
pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 65535;

pub trait NetDevice: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn hw_addr(&self) -> MacAddr;

    fn is_link_up(&self) -> bool;

    fn mtu(&self) -> u32 {
        DEFAULT_MTU
    }
}

/// An in-memory network device.
#[derive(Debug)]
pub struct SoftNetDevice {
    name: String,
    hw_addr: spin::Mutex<MacAddr>,
    link_up: AtomicBool,
    mtu: AtomicU32,
}

impl SoftNetDevice {
    pub fn new(name: impl Into<String>, hw_addr: MacAddr) -> Self {
        SoftNetDevice {
            name: name.into(),
            hw_addr: spin::Mutex::new(hw_addr),
            link_up: AtomicBool::new(true),
            mtu: AtomicU32::new(DEFAULT_MTU),
        }
    }

    /// `blue<index>` with a hardware address under the default prefix.
    pub fn for_index(index: u8) -> Self {
        Self::new(
            format!("blue{}", index),
            MacAddr::with_default_prefix(index.wrapping_add(1)),
        )
    }

    pub fn set_link(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::InvalidArgument(format!(
                "MTU {} out of range [{}, {}]",
                mtu, MIN_MTU, MAX_MTU
            )));
        }
        self.mtu.store(mtu, Ordering::Release);
        Ok(())
    }

    pub fn set_hw_addr(&self, hw_addr: MacAddr) {
        *self.hw_addr.lock() = hw_addr;
    }
}

impl NetDevice for SoftNetDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw_addr(&self) -> MacAddr {
        *self.hw_addr.lock()
    }

    fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }
}
