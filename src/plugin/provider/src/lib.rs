//! User-space provider of bluerdma devices.
//!
//! The provider owns the device registry of a process-external service and exposes the verbs on
//! typed handles to client processes. Every client process gets its own [`Ops`]; handles of
//! contexts opened by one process are invisible to all others. Backends are registered
//! explicitly by name in a [`BackendRegistry`].
use thiserror::Error;

use bluerdma::api::Handle;
use bluerdma::resource::Error as ResourceError;

pub mod config;
pub mod module;
pub mod ops;
pub mod registry;
pub(crate) mod state;
pub mod state_mgr;

pub use config::ProviderConfig;
pub use module::Provider;
pub use ops::Ops;
pub use registry::BackendRegistry;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource table error: {0}")]
    Resource(#[from] ResourceError),
    #[error("{0}")]
    Verbs(#[from] bluerdma::api::Error),
    #[error("No backend named {0:?}")]
    BackendNotFound(String),
    #[error("Backend {0:?} is already registered")]
    BackendExists(String),
    #[error("Handle {0:?} does not belong to any context of this process")]
    NotOwned(Handle),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl From<ApiError> for bluerdma::api::Error {
    fn from(other: ApiError) -> Self {
        use bluerdma::api::Error;
        match other {
            ApiError::Resource(e) => e.into(),
            ApiError::Verbs(e) => e,
            ApiError::BackendNotFound(_) | ApiError::NotOwned(_) => {
                Error::NotFound(other.to_string())
            }
            ApiError::BackendExists(_) | ApiError::Codec(_) => {
                Error::InvalidArgument(other.to_string())
            }
        }
    }
}

/// Builds a provider from its TOML configuration and attaches the configured devices.
pub fn init_module(config_string: Option<&str>) -> anyhow::Result<Provider> {
    let config = ProviderConfig::new(config_string)?;
    bluerdma::logging::init_log(&config.core(), false);
    let provider = Provider::new(config)?;
    provider.attach_configured()?;
    Ok(provider)
}
