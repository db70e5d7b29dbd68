use std::sync::Arc;

use nix::unistd::Pid;

use bluerdma::api::gid::MacAddr;
use bluerdma::backend::BackendFactory;
use bluerdma::log;
use bluerdma::netdev::{NetDevice, SoftNetDevice};
use bluerdma::{Device, DeviceRegistry, Handle};

use crate::config::ProviderConfig;
use crate::ops::Ops;
use crate::registry::BackendRegistry;
use crate::state::{Shared, State};
use crate::state_mgr::SharedStateManager;
use crate::ApiError;

pub struct Provider {
    config: ProviderConfig,
    registry: Arc<DeviceRegistry>,
    backends: BackendRegistry,
    pub state_mgr: SharedStateManager<Shared>,
}

impl Provider {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(DeviceRegistry::new(config.device.clone())?);
        Ok(Provider {
            config,
            registry,
            backends: BackendRegistry::with_builtin(),
            state_mgr: SharedStateManager::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    #[inline]
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn register_backend(&self, factory: Arc<dyn BackendFactory>) -> Result<(), ApiError> {
        self.backends.register(factory)
    }

    /// Attaches a device on `netdev` served by the backend registered as `backend`.
    pub fn attach(
        &self,
        netdev: Arc<dyn NetDevice>,
        backend: &str,
    ) -> Result<Arc<Device>, ApiError> {
        let factory = self.backends.get(backend)?;
        Ok(self.registry.attach(netdev, factory)?)
    }

    /// Attaches every device listed in the configuration.
    pub fn attach_configured(&self) -> anyhow::Result<Vec<Arc<Device>>> {
        let mut devices = Vec::with_capacity(self.config.devices.len());
        for (i, desc) in self.config.devices.iter().enumerate() {
            let hw_addr = desc
                .hw_addr
                .unwrap_or_else(|| MacAddr::with_default_prefix((i as u8).wrapping_add(1)));
            let netdev = SoftNetDevice::new(desc.netdev.clone(), hw_addr);
            netdev.set_mtu(desc.mtu)?;
            netdev.set_link(desc.link_up);
            let backend = desc
                .backend
                .as_deref()
                .unwrap_or(&self.config.default_backend);
            devices.push(self.attach(Arc::new(netdev), backend)?);
        }
        Ok(devices)
    }

    pub fn detach(&self, device: Handle) -> Result<(), ApiError> {
        Ok(self.registry.detach(device)?)
    }

    /// The API of client process `pid`. All `Ops` of one process share its contexts; they are
    /// torn down once the last of them is dropped.
    pub fn ops(&self, pid: Pid) -> Ops {
        let shared = self
            .state_mgr
            .get_or_create_with(pid, || Shared::new(pid, Arc::clone(&self.registry)));
        Ops::new(State::new(shared))
    }

    pub fn has_client(&self, pid: Pid) -> bool {
        self.state_mgr.contains(pid)
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        let clients = self.state_mgr.pids();
        if !clients.is_empty() {
            log::warn!("provider dropped with {} client(s) alive", clients.len());
        }
    }
}
