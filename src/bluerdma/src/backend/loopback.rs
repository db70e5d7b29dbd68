//! A backend that connects the QPs of one device to each other in memory.
//!
//! Sends are matched with receives posted on the destination QPN. Payload is not copied; only
//! the completions a real transport would produce are generated. RDMA read and write complete
//! immediately.
use std::collections::VecDeque;
use std::sync::Arc;

use fnv::FnvHashMap;
use spin::Mutex;

use bluerdma_api::net::{QpState, QpType, RecvWr, SendFlags, SendWr, WcStatus, WrOpcode};

use super::{Backend, BackendFactory, Completer, DeviceInfo};
use crate::log;
use crate::Result;

pub const LOOPBACK: &str = "loopback";

#[derive(Debug)]
struct PostedRecv {
    completer: Completer,
    capacity: u64,
}

#[derive(Debug, Default)]
pub struct LoopbackBackend {
    device: String,
    recvs: Mutex<FnvHashMap<u32, VecDeque<PostedRecv>>>,
}

impl LoopbackBackend {
    pub fn new(device: &DeviceInfo) -> Self {
        LoopbackBackend {
            device: device.name.clone(),
            recvs: Mutex::new(FnvHashMap::default()),
        }
    }

    fn take_recv(&self, qpn: u32) -> Option<PostedRecv> {
        self.recvs.lock().get_mut(&qpn).and_then(|q| q.pop_front())
    }

    // The request is queued on the QP by now, so a failed completion means it was already
    // flushed. It must not be reported a second time as a rejection.
    fn finish_send(&self, completer: &Completer, status: WcStatus) -> Result<()> {
        if let Err(e) = completer.complete_send(status) {
            log::debug!(
                "{}: send on QPN {:#x} already completed: {}",
                self.device,
                completer.qpn(),
                e
            );
        }
        Ok(())
    }

    fn deliver(&self, completer: &Completer, wr: &SendWr, dest: u32) -> Result<()> {
        let len = wr.total_len();
        let solicited = wr.send_flags.contains(SendFlags::SOLICITED);
        loop {
            let recv = match self.take_recv(dest) {
                Some(recv) => recv,
                // an unreliable datagram without a receiver is dropped silently
                None if completer.qp_type() == QpType::UD => {
                    return self.finish_send(completer, WcStatus::Success)
                }
                None => return self.finish_send(completer, WcStatus::RnrRetryExceeded),
            };
            if len > recv.capacity {
                // ignore failures, the receiver may be gone already
                let _ = recv
                    .completer
                    .complete_recv(WcStatus::LocalLengthError, 0, None, completer.qpn(), false);
                return self.finish_send(completer, WcStatus::RemoteInvalidRequest);
            }
            match recv.completer.complete_recv(
                WcStatus::Success,
                len as u32,
                wr.imm_data,
                completer.qpn(),
                solicited,
            ) {
                Ok(()) => return self.finish_send(completer, WcStatus::Success),
                Err(e) => {
                    log::debug!("{}: stale receive on QPN {:#x}: {}", self.device, dest, e);
                }
            }
        }
    }
}

impl Backend for LoopbackBackend {
    fn post_send(&self, completer: Completer, wr: &SendWr) -> Result<()> {
        match wr.opcode {
            WrOpcode::Send | WrOpcode::SendWithImm => {
                let dest = match completer.qp_type() {
                    QpType::RC => completer.dest_qpn(),
                    QpType::UD => wr.ud.map(|ud| ud.remote_qpn),
                };
                match dest {
                    Some(dest) => self.deliver(&completer, wr, dest),
                    None => self.finish_send(&completer, WcStatus::GeneralError),
                }
            }
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm | WrOpcode::RdmaRead => {
                self.finish_send(&completer, WcStatus::Success)
            }
        }
    }

    fn post_recv(&self, completer: Completer, wr: &RecvWr) -> Result<()> {
        let qpn = completer.qpn();
        self.recvs
            .lock()
            .entry(qpn)
            .or_default()
            .push_back(PostedRecv {
                completer,
                capacity: wr.total_len(),
            });
        Ok(())
    }

    fn qp_modified(&self, qpn: u32, state: QpState) {
        if matches!(state, QpState::Reset | QpState::Error) {
            self.recvs.lock().remove(&qpn);
        }
    }

    fn qp_destroyed(&self, qpn: u32) {
        self.recvs.lock().remove(&qpn);
    }

    fn shutdown(&self) {
        let mut recvs = self.recvs.lock();
        log::info!(
            "{}: loopback backend shut down, dropping receives of {} QP(s)",
            self.device,
            recvs.len()
        );
        recvs.clear();
    }
}

#[derive(Debug, Default)]
pub struct LoopbackFactory;

impl BackendFactory for LoopbackFactory {
    fn name(&self) -> &str {
        LOOPBACK
    }

    fn create(&self, device: &DeviceInfo) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(LoopbackBackend::new(device)))
    }
}
