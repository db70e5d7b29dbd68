//! Devices and the registry that owns them.
use std::fmt::Write;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use bluerdma_api::gid::{Gid, GidAttr, MacAddr};
use bluerdma_api::net::{DeviceAttr, Mtu, PhysPortState, PortAttr, PortState};
use bluerdma_api::Handle;

use crate::backend::{Backend, BackendFactory, DeviceInfo};
use crate::config::DeviceConfig;
use crate::context::Context;
use crate::gid::GidTable;
use crate::log;
use crate::mr::MrTable;
use crate::netdev::NetDevice;
use crate::qp::{QpLimits, QpnAllocator};
use crate::resource::ResourceTable;
use crate::{Error, Result};

/// The only port of a device.
pub const PORT_NUM: u8 = 1;
pub const PKEY_TABLE_LEN: u16 = 1;
pub const VENDOR_ID: u32 = 0x1bd4;
const FW_VERSION: &str = "0.1.0";
const MAX_MSG_SIZE: u32 = 1 << 31;

/// Counts objects of one kind against a device-wide limit.
#[derive(Debug)]
pub(crate) struct Quota {
    what: &'static str,
    max: usize,
    used: AtomicUsize,
}

impl Quota {
    fn new(what: &'static str, max: usize) -> Self {
        Quota {
            what,
            max,
            used: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire(&self) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then(|| n + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::ResourceExhausted(format!("{} limit {} reached", self.what, self.max)))
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        let prev = self.used.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "{} quota released more than acquired", self.what);
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    contexts: usize,
    detached: bool,
}

#[derive(Debug)]
pub struct Device {
    index: u32,
    name: String,
    config: DeviceConfig,
    netdev: Arc<dyn NetDevice>,
    gid_table: GidTable,
    factory: Arc<dyn BackendFactory>,
    backend: Mutex<Option<Arc<dyn Backend>>>,
    lifecycle: Mutex<Lifecycle>,
    context_ids: Arc<AtomicU32>,
    pub(crate) qpns: QpnAllocator,
    pub(crate) mrs: Arc<MrTable>,
    pub(crate) pds: Quota,
    pub(crate) cqs: Quota,
}

impl Device {
    fn new(
        index: u32,
        config: DeviceConfig,
        netdev: Arc<dyn NetDevice>,
        factory: Arc<dyn BackendFactory>,
        context_ids: Arc<AtomicU32>,
    ) -> Self {
        let gid_table = GidTable::with_default(
            config.gid_table_len,
            netdev.hw_addr(),
            PORT_NUM,
            netdev.name(),
        );
        Device {
            index,
            name: format!("bluerdma{}", index),
            qpns: QpnAllocator::new(config.max_qp),
            mrs: Arc::new(MrTable::new(config.max_mr)),
            pds: Quota::new("PD", config.max_pd),
            cqs: Quota::new("CQ", config.max_cq),
            config,
            netdev,
            gid_table,
            factory,
            backend: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            context_ids,
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        Handle(self.index as u64)
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub fn netdev(&self) -> &Arc<dyn NetDevice> {
        &self.netdev
    }

    #[inline]
    pub fn gid_table(&self) -> &GidTable {
        &self.gid_table
    }

    pub fn hw_addr(&self) -> MacAddr {
        self.netdev.hw_addr()
    }

    /// The EUI-64 interface id of the hardware address.
    pub fn node_guid(&self) -> u64 {
        Gid::from_mac(self.hw_addr()).interface_id()
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            name: self.name.clone(),
            netdev: self.netdev.name().to_owned(),
            hw_addr: self.hw_addr(),
        }
    }

    /// Number of memory regions registered across all contexts.
    pub fn mr_count(&self) -> usize {
        self.mrs.live()
    }

    /// Number of PDs allocated across all contexts.
    pub fn pd_count(&self) -> usize {
        self.pds.used()
    }

    /// Number of open contexts.
    pub fn contexts(&self) -> usize {
        self.lifecycle.lock().contexts
    }

    /// Opens a session on the device. The first open creates the backend instance.
    pub fn open(self: &Arc<Self>) -> Result<Arc<Context>> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.detached {
            return Err(Error::InvalidState(format!("{} is detached", self.name)));
        }
        let backend = self.backend()?;
        let id = self.context_ids.fetch_add(1, Ordering::AcqRel);
        lifecycle.contexts += 1;
        drop(lifecycle);
        log::debug!("OpenDevice, device: {}, context id: {}", self.name, id);
        Ok(Arc::new(Context::new(Arc::clone(self), backend, id)))
    }

    pub(crate) fn context_closed(&self) {
        let mut lifecycle = self.lifecycle.lock();
        assert!(lifecycle.contexts > 0, "{}: context count underflow", self.name);
        lifecycle.contexts -= 1;
    }

    fn backend(&self) -> Result<Arc<dyn Backend>> {
        let mut backend = self.backend.lock();
        if let Some(b) = backend.as_ref() {
            return Ok(Arc::clone(b));
        }
        let created = self.factory.create(&self.info())?;
        log::info!(
            "{}: {} backend initialized",
            self.name,
            self.factory.name()
        );
        *backend = Some(Arc::clone(&created));
        Ok(created)
    }

    fn begin_detach(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.contexts > 0 {
            return Err(Error::Busy(format!(
                "{} has {} open context(s)",
                self.name, lifecycle.contexts
            )));
        }
        if lifecycle.detached {
            return Err(Error::InvalidState(format!("{} is detached", self.name)));
        }
        lifecycle.detached = true;
        Ok(())
    }

    fn release_backend(&self) {
        if let Some(backend) = self.backend.lock().take() {
            backend.shutdown();
            log::info!("{}: backend released", self.name);
        }
    }

    pub(crate) fn qp_limits(&self) -> QpLimits {
        QpLimits {
            max_qp_rd_atom: self.config.max_qp_rd_atom,
            pkey_tbl_len: PKEY_TABLE_LEN,
            gid_tbl_len: self.gid_table.len() as u32,
            active_mtu: Mtu::from_bytes(self.netdev.mtu()),
        }
    }

    fn check_port(&self, port_num: u8) -> Result<()> {
        if port_num == PORT_NUM {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{} has no port {}",
                self.name, port_num
            )))
        }
    }

    pub fn query_device(&self) -> DeviceAttr {
        let c = &self.config;
        DeviceAttr {
            fw_ver: FW_VERSION.to_owned(),
            node_guid: self.node_guid(),
            sys_image_guid: self.node_guid(),
            hw_addr: self.hw_addr(),
            vendor_id: VENDOR_ID,
            vendor_part_id: 0,
            max_mr_size: u64::MAX,
            max_qp: (c.max_qp - 1) as u32,
            max_qp_wr: c.max_qp_wr,
            max_sge: c.max_sge,
            max_cq: c.max_cq as u32,
            max_cqe: c.max_cqe,
            max_mr: c.max_mr as u32,
            max_pd: c.max_pd as u32,
            max_qp_rd_atom: c.max_qp_rd_atom,
            max_inline_data: c.max_inline_data,
            phys_port_cnt: 1,
        }
    }

    pub fn query_port(&self, port_num: u8) -> Result<PortAttr> {
        self.check_port(port_num)?;
        let (state, phys_state) = if self.netdev.is_link_up() {
            (PortState::Active, PhysPortState::LinkUp)
        } else {
            (PortState::Down, PhysPortState::Disabled)
        };
        Ok(PortAttr {
            state,
            phys_state,
            max_mtu: Mtu::Mtu4096,
            active_mtu: Mtu::from_bytes(self.netdev.mtu()),
            gid_tbl_len: self.gid_table.len() as u32,
            pkey_tbl_len: PKEY_TABLE_LEN,
            lid: 0,
            max_msg_sz: MAX_MSG_SIZE,
        })
    }

    pub fn query_pkey(&self, port_num: u8, index: u16) -> Result<u16> {
        self.check_port(port_num)?;
        if index >= PKEY_TABLE_LEN {
            return Err(Error::InvalidArgument(format!(
                "pkey index {} out of range [0, {})",
                index, PKEY_TABLE_LEN
            )));
        }
        Ok(self.config.default_pkey)
    }

    pub fn query_gid(&self, port_num: u8, index: u32) -> Result<Gid> {
        self.check_port(port_num)?;
        self.gid_table.query(index as usize)
    }

    pub fn add_gid(&self, index: u32, gid: Gid, attr: GidAttr) -> Result<()> {
        self.gid_table.add(index as usize, gid, attr)
    }

    pub fn del_gid(&self, index: u32) -> Result<()> {
        self.gid_table.del(index as usize)
    }

    /// Text listing of the valid GIDs, one per line.
    pub fn show_gids(&self) -> String {
        let mut out = String::new();
        for (_, gid) in self.gid_table.valid_entries() {
            let _ = writeln!(out, "{}", gid);
        }
        out
    }

    /// Text form of the hardware address followed by a newline.
    pub fn show_mac(&self) -> String {
        format!("{}\n", self.hw_addr())
    }
}

/// Owns every attached device. Devices are addressed by handle, contexts get ids unique across
/// the registry.
#[derive(Debug)]
pub struct DeviceRegistry {
    config: DeviceConfig,
    devices: ResourceTable<Device>,
    next_index: AtomicU32,
    context_ids: Arc<AtomicU32>,
}

impl DeviceRegistry {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        Ok(DeviceRegistry {
            config,
            devices: ResourceTable::default(),
            next_index: AtomicU32::new(0),
            context_ids: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn attach(
        &self,
        netdev: Arc<dyn NetDevice>,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Arc<Device>> {
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        let device = Device::new(
            index,
            self.config.clone(),
            netdev,
            factory,
            Arc::clone(&self.context_ids),
        );
        let device = self.devices.insert(device.handle(), device)?;
        log::info!(
            "attached {} on {}, hw_addr: {}",
            device.name(),
            device.netdev().name(),
            device.hw_addr()
        );
        Ok(device)
    }

    /// Removes the device and shuts its backend down. Fails with `Busy` while contexts are open.
    pub fn detach(&self, handle: Handle) -> Result<()> {
        let device = self.devices.get(&handle)?;
        device.begin_detach()?;
        self.devices.remove(&handle)?;
        device.release_backend();
        log::info!("detached {}", device.name());
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<Device>> {
        Ok(self.devices.get(&handle)?)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .inner()
            .iter()
            .find(|e| e.data().name() == name)
            .map(|e| e.data())
    }

    /// Attached devices in attach order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.devices.inner().iter().map(|e| e.data()).collect();
        devices.sort_by_key(|d| d.index());
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
