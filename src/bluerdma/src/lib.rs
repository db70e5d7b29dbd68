//! Resource and protocol layer of the bluerdma software RDMA adapter.
//!
//! The crate owns the verbs object model (device, context, PD, CQ, QP, MR, GID table) and the
//! rules that keep it consistent under concurrent use. Moving bytes is left to a [`Backend`]
//! supplied when a device is attached.
//!
//! [`Backend`]: backend::Backend

pub extern crate tracing;
// alias
pub extern crate tracing as log;

pub mod backend;
pub mod config;
pub mod context;
pub mod cq;
pub mod device;
pub mod gid;
pub mod logging;
pub mod mr;
pub mod netdev;
pub mod pd;
pub mod qp;
pub mod resource;
pub mod verbs;

pub use bluerdma_api as api;
pub use bluerdma_api::{Error, Handle};

pub use context::Context;
pub use device::{Device, DeviceRegistry};

pub type Result<T> = std::result::Result<T, Error>;
