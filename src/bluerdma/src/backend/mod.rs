//! The contract between the verbs core and whatever moves the bytes.
//!
//! A [`BackendFactory`] is handed to the registry when a device is attached. The device creates
//! one [`Backend`] from it the first time a context is opened and shuts it down at detach. The
//! core validates and queues every work request before forwarding it; the backend reports the
//! outcome through the [`Completer`] it receives with the request.
use std::fmt;
use std::sync::Arc;

use bluerdma_api::gid::MacAddr;
use bluerdma_api::net::{QpState, QpType, RecvWr, SendWr, WcStatus};

use crate::qp::QueuePair;
use crate::Result;

pub mod loopback;

/// What a backend learns about the device it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub netdev: String,
    pub hw_addr: MacAddr,
}

pub trait Backend: Send + Sync + fmt::Debug {
    /// Starts moving a validated send. An error means the request was not taken; it is removed
    /// from the send queue and the caller sees `Fault`.
    fn post_send(&self, completer: Completer, wr: &SendWr) -> Result<()>;

    fn post_recv(&self, completer: Completer, wr: &RecvWr) -> Result<()>;

    /// A QP changed state through `modify_qp`.
    fn qp_modified(&self, _qpn: u32, _state: QpState) {}

    /// The QP is gone. Completers the backend still holds for it fail with `InvalidState`.
    fn qp_destroyed(&self, _qpn: u32) {}

    /// Called once, when the device is detached.
    fn shutdown(&self) {}
}

pub trait BackendFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn create(&self, device: &DeviceInfo) -> Result<Arc<dyn Backend>>;
}

/// Reports the outcome of work the backend accepted. Send and receive completions of one QP are
/// matched to outstanding requests in posting order.
#[derive(Debug, Clone)]
pub struct Completer {
    qp: Arc<QueuePair>,
}

impl Completer {
    pub(crate) fn new(qp: Arc<QueuePair>) -> Self {
        Completer { qp }
    }

    #[inline]
    pub fn qpn(&self) -> u32 {
        self.qp.qpn()
    }

    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.qp.qp_type()
    }

    pub fn dest_qpn(&self) -> Option<u32> {
        self.qp.dest_qpn()
    }

    pub fn complete_send(&self, status: WcStatus) -> Result<()> {
        self.qp.complete_send(status)
    }

    pub fn complete_recv(
        &self,
        status: WcStatus,
        byte_len: u32,
        imm_data: Option<u32>,
        src_qp: u32,
        solicited: bool,
    ) -> Result<()> {
        self.qp
            .complete_recv(status, byte_len, imm_data, src_qp, solicited)
    }

    /// A transport failure not tied to a single request: the QP moves to ERROR and its
    /// outstanding work is flushed.
    pub fn fault(&self) -> Result<()> {
        self.qp.fault()
    }
}
