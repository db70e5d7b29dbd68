//! Backends known to the provider, by name.
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fnv::FnvBuildHasher;

use bluerdma::backend::loopback::LoopbackFactory;
use bluerdma::backend::BackendFactory;
use bluerdma::log;

use crate::ApiError;

#[derive(Debug, Default)]
pub struct BackendRegistry {
    factories: DashMap<String, Arc<dyn BackendFactory>, FnvBuildHasher>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the in-memory loopback backend.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry
            .factories
            .insert(LoopbackFactory.name().to_owned(), Arc::new(LoopbackFactory));
        registry
    }

    pub fn register(&self, factory: Arc<dyn BackendFactory>) -> Result<(), ApiError> {
        let name = factory.name().to_owned();
        match self.factories.entry(name) {
            Entry::Occupied(e) => Err(ApiError::BackendExists(e.key().clone())),
            Entry::Vacant(e) => {
                log::info!("backend {:?} registered", e.key());
                e.insert(factory);
                Ok(())
            }
        }
    }

    /// Devices already attached keep the factory they were created with.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn BackendFactory>> {
        self.factories.remove(name).map(|(_, f)| f)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendFactory>, ApiError> {
        self.factories
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| ApiError::BackendNotFound(name.to_owned()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluerdma::backend::loopback::LOOPBACK;
    use bluerdma::backend::{Backend, DeviceInfo};

    #[derive(Debug)]
    struct Named(&'static str);

    impl BackendFactory for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn create(&self, device: &DeviceInfo) -> bluerdma::Result<Arc<dyn Backend>> {
            LoopbackFactory.create(device)
        }
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.names(), vec![LOOPBACK.to_owned()]);
        assert!(matches!(
            registry.register(Arc::new(LoopbackFactory)),
            Err(ApiError::BackendExists(_))
        ));

        registry.register(Arc::new(Named("dma"))).unwrap();
        assert_eq!(registry.get("dma").unwrap().name(), "dma");
        assert_eq!(registry.names(), vec!["dma".to_owned(), LOOPBACK.to_owned()]);

        assert!(registry.unregister("dma").is_some());
        assert!(registry.unregister("dma").is_none());
        assert!(matches!(
            registry.get("dma"),
            Err(ApiError::BackendNotFound(_))
        ));
    }
}
