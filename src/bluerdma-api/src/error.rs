use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported synchronously by verbs operations.
///
/// Data-plane faults are not returned through this type; they show up as work completions
/// carrying an error status.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A required attribute is absent from the attribute mask, or a present one is not accepted
    /// by the requested transition or carries an out-of-range value.
    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The object still owns, or is referenced by, other live objects.
    #[error("Resource busy: {0}")]
    Busy(String),
    #[error("Fault: {0}")]
    Fault(String),
}

impl Error {
    /// The POSIX errno a C caller on the other side of the provider boundary expects.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::InvalidAttribute(_) | Error::InvalidState(_) => {
                libc::EINVAL
            }
            Error::NotFound(_) => libc::ENOENT,
            Error::ResourceExhausted(_) => libc::ENOMEM,
            Error::Busy(_) => libc::EBUSY,
            Error::Fault(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidArgument("x".into()).to_errno(), libc::EINVAL);
        assert_eq!(Error::InvalidAttribute("x".into()).to_errno(), libc::EINVAL);
        assert_eq!(Error::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(Error::ResourceExhausted("x".into()).to_errno(), libc::ENOMEM);
        assert_eq!(Error::Busy("x".into()).to_errno(), libc::EBUSY);
        assert_eq!(Error::Fault("x".into()).to_errno(), libc::EIO);
    }
}
