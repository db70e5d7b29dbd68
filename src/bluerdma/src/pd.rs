use bluerdma_api::Handle;

/// A protection domain. It carries no state besides its identity; QPs and MRs created in it
/// keep it alive through the owning context's use counts.
#[derive(Debug)]
pub struct ProtectionDomain {
    handle: Handle,
}

impl ProtectionDomain {
    pub(crate) fn new(handle: Handle) -> Self {
        ProtectionDomain { handle }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Handle of the owning context.
    #[inline]
    pub fn context(&self) -> Handle {
        self.handle.owner()
    }
}
