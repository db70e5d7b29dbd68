//! Types shared by the bluerdma verbs core and the user-space provider.
#![allow(missing_docs)]

pub mod handle;
pub use handle::{AsHandle, Handle};

pub mod error;
pub use error::Error;

pub mod gid;
pub mod net;

pub mod cmd;
pub mod dp;
pub mod wire;
