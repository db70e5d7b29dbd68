use std::sync::Arc;

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use nix::unistd::Pid;

use bluerdma::api::Handle;
use bluerdma::log;
use bluerdma::{Context, DeviceRegistry};

use crate::ApiError;

pub(crate) struct State {
    pub(crate) shared: Arc<Shared>,
}

impl State {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        State { shared }
    }

    #[inline]
    pub(crate) fn resource(&self) -> &Resource {
        &self.shared.resource
    }
}

pub struct Shared {
    // Pid as the identifier of this process
    pub pid: Pid,
    pub resource: Resource,
}

impl Shared {
    pub(crate) fn new(pid: Pid, registry: Arc<DeviceRegistry>) -> Self {
        log::debug!("new client process {}", pid);
        Shared {
            pid,
            resource: Resource::new(registry),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let n = self.resource.ctx_table.len();
        if n > 0 {
            log::info!(
                "client process {} is gone, releasing {} context(s)",
                self.pid,
                n
            );
        }
        // each context tears down what it still owns when dropped
        self.resource.ctx_table.clear();
    }
}

/// The contexts a client process opened. Object handles are routed to their context through the
/// owner bits of the handle.
pub struct Resource {
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) ctx_table: DashMap<Handle, Arc<Context>, FnvBuildHasher>,
}

impl Resource {
    fn new(registry: Arc<DeviceRegistry>) -> Self {
        Resource {
            registry,
            ctx_table: DashMap::default(),
        }
    }

    pub(crate) fn insert_context(&self, ctx: Arc<Context>) -> Handle {
        let handle = ctx.handle();
        self.ctx_table.insert(handle, ctx);
        handle
    }

    pub(crate) fn context(&self, ctx: Handle) -> Result<Arc<Context>, ApiError> {
        self.ctx_table
            .get(&ctx)
            .map(|c| Arc::clone(c.value()))
            .ok_or(ApiError::NotOwned(ctx))
    }

    /// The context owning the object `handle`.
    pub(crate) fn owner_of(&self, handle: Handle) -> Result<Arc<Context>, ApiError> {
        self.ctx_table
            .get(&handle.owner())
            .map(|c| Arc::clone(c.value()))
            .ok_or(ApiError::NotOwned(handle))
    }

    pub(crate) fn remove_context(&self, ctx: Handle) -> Option<Arc<Context>> {
        self.ctx_table.remove(&ctx).map(|(_, c)| c)
    }

    pub fn contexts(&self) -> usize {
        self.ctx_table.len()
    }
}
