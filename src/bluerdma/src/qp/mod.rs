//! Queue pairs.
//!
//! Every QP serializes its state, attributes and outstanding work behind one lock. Posting and
//! completing both go through it, so completions of a QP reach its CQs in the order the work was
//! posted. Posts additionally hold a per-queue post lock across the call into the backend; the
//! backend may complete work synchronously, which only takes the state lock.
use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use spin::Mutex;

use bluerdma_api::net::{
    AccessFlags, CompletionQueue as CqHandle, Mtu, QpAttr, QpAttrMask, QpCapability, QpInitAttr,
    QpState, QpType, RecvWr, SendFlags, SendWr, Sge, WcFlags, WcOpcode, WcStatus, WorkCompletion,
    WrOpcode,
};
use bluerdma_api::Handle;

use crate::backend::{Backend, Completer};
use crate::cq::CompletionQueue;
use crate::log;
use crate::mr::MrTable;
use crate::{Error, Result};

pub(crate) mod state;

pub const QPN_INDEX_BITS: u32 = 10;
pub const QPN_KEY_BITS: u32 = 14;
pub const MAX_QP_CNT: usize = 1 << QPN_INDEX_BITS;

const PSN_MASK: u32 = (1 << 24) - 1;
const QPN_MASK: u32 = (1 << 24) - 1;

#[inline]
pub fn qpn_index(qpn: u32) -> usize {
    (qpn >> QPN_KEY_BITS) as usize
}

/// QPN slots of a device. Slot 0 is reserved for the special QPs.
#[derive(Debug)]
pub(crate) struct QpnAllocator {
    used: Mutex<Vec<bool>>,
}

impl QpnAllocator {
    pub(crate) fn new(max_qp: usize) -> Self {
        let mut used = vec![false; max_qp.min(MAX_QP_CNT)];
        used[0] = true;
        QpnAllocator {
            used: Mutex::new(used),
        }
    }

    pub(crate) fn alloc(&self) -> Option<u32> {
        let mut used = self.used.lock();
        let index = used.iter().position(|u| !*u)?;
        used[index] = true;
        let key = rand::thread_rng().gen_range(0..1u32 << QPN_KEY_BITS);
        Some(((index as u32) << QPN_KEY_BITS) | key)
    }

    pub(crate) fn free(&self, qpn: u32) {
        let index = qpn_index(qpn);
        let mut used = self.used.lock();
        assert!(
            index != 0 && used[index],
            "QPN {:#x} freed but not allocated",
            qpn
        );
        used[index] = false;
    }
}

/// Device limits a QP checks its attributes against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QpLimits {
    pub(crate) max_qp_rd_atom: u8,
    pub(crate) pkey_tbl_len: u16,
    pub(crate) gid_tbl_len: u32,
    pub(crate) active_mtu: Mtu,
}

#[derive(Debug, Clone)]
struct PendingWr {
    seq: u64,
    wr_id: u64,
    opcode: WcOpcode,
    signaled: bool,
    // empty for inline sends
    sg_list: Vec<Sge>,
    access: AccessFlags,
    byte_len: u32,
}

#[derive(Debug, Default)]
struct QpInner {
    state: QpState,
    attr: QpAttr,
    destroyed: bool,
    sq: VecDeque<PendingWr>,
    rq: VecDeque<PendingWr>,
    next_seq: u64,
}

impl QpInner {
    fn ensure_alive(&self, qpn: u32) -> Result<()> {
        if self.destroyed {
            Err(Error::InvalidState(format!("QP {:#x} is destroyed", qpn)))
        } else {
            Ok(())
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

pub(crate) struct QpParams {
    pub(crate) handle: Handle,
    pub(crate) qpn: u32,
    pub(crate) pd: Handle,
    pub(crate) init_attr: QpInitAttr,
    pub(crate) send_cq: Arc<CompletionQueue>,
    pub(crate) recv_cq: Arc<CompletionQueue>,
    pub(crate) mrs: Arc<MrTable>,
    pub(crate) limits: QpLimits,
}

#[derive(Debug)]
pub struct QueuePair {
    handle: Handle,
    qpn: u32,
    qp_type: QpType,
    pd: Handle,
    cap: QpCapability,
    sq_sig_all: bool,
    send_cq: Arc<CompletionQueue>,
    recv_cq: Arc<CompletionQueue>,
    mrs: Arc<MrTable>,
    limits: QpLimits,
    inner: Mutex<QpInner>,
    sq_post: Mutex<()>,
    rq_post: Mutex<()>,
}

impl QueuePair {
    pub(crate) fn new(params: QpParams) -> Self {
        QueuePair {
            handle: params.handle,
            qpn: params.qpn,
            qp_type: params.init_attr.qp_type,
            pd: params.pd,
            cap: params.init_attr.cap,
            sq_sig_all: params.init_attr.sq_sig_all,
            send_cq: params.send_cq,
            recv_cq: params.recv_cq,
            mrs: params.mrs,
            limits: params.limits,
            inner: Mutex::new(QpInner::default()),
            sq_post: Mutex::new(()),
            rq_post: Mutex::new(()),
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    #[inline]
    pub fn pd(&self) -> Handle {
        self.pd
    }

    #[inline]
    pub fn cap(&self) -> QpCapability {
        self.cap
    }

    #[inline]
    pub fn send_cq(&self) -> &Arc<CompletionQueue> {
        &self.send_cq
    }

    #[inline]
    pub fn recv_cq(&self) -> &Arc<CompletionQueue> {
        &self.recv_cq
    }

    pub fn state(&self) -> QpState {
        self.inner.lock().state
    }

    /// Destination QPN negotiated on the way to RTR.
    pub fn dest_qpn(&self) -> Option<u32> {
        let inner = self.inner.lock();
        match inner.state {
            QpState::Rtr | QpState::Rts | QpState::Sqe => Some(inner.attr.dest_qp_num),
            _ => None,
        }
    }

    pub fn query(&self) -> (QpAttr, QpInitAttr) {
        let inner = self.inner.lock();
        let mut attr = inner.attr.clone();
        attr.qp_state = inner.state;
        attr.cur_qp_state = inner.state;
        let init_attr = QpInitAttr {
            send_cq: CqHandle(self.send_cq.handle()),
            recv_cq: CqHandle(self.recv_cq.handle()),
            cap: self.cap,
            qp_type: self.qp_type,
            sq_sig_all: self.sq_sig_all,
        };
        (attr, init_attr)
    }

    pub(crate) fn modify(&self, attr: &QpAttr, mask: QpAttrMask) -> Result<QpState> {
        let mut inner = self.inner.lock();
        inner.ensure_alive(self.qpn)?;
        let cur = inner.state;
        if mask.contains(QpAttrMask::CUR_STATE) && attr.cur_qp_state != cur {
            return Err(Error::InvalidState(format!(
                "QP {:#x} is in {:?}, not {:?}",
                self.qpn, cur, attr.cur_qp_state
            )));
        }
        let next = if mask.contains(QpAttrMask::STATE) {
            attr.qp_state
        } else {
            cur
        };
        state::check(self.qp_type, cur, next, mask)?;
        self.check_attr(attr, mask)?;

        apply_attr(&mut inner.attr, attr, mask);
        inner.state = next;
        match next {
            QpState::Reset => {
                inner.attr = QpAttr::default();
                inner.sq.clear();
                inner.rq.clear();
            }
            QpState::Error => self.flush(&mut inner, true),
            _ => {}
        }
        log::debug!("ModifyQp, qpn: {:#x}, {:?} -> {:?}", self.qpn, cur, next);
        Ok(next)
    }

    fn check_attr(&self, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        let invalid = |what: String| Err(Error::InvalidAttribute(what));
        if mask.contains(QpAttrMask::PORT) && attr.port_num != 1 {
            return invalid(format!("port {} does not exist", attr.port_num));
        }
        if mask.contains(QpAttrMask::PKEY_INDEX) && attr.pkey_index >= self.limits.pkey_tbl_len {
            return invalid(format!("pkey index {} out of range", attr.pkey_index));
        }
        if mask.contains(QpAttrMask::ACCESS_FLAGS)
            && !AccessFlags::all().contains(attr.qp_access_flags)
        {
            return invalid(format!("access flags {:#x}", attr.qp_access_flags.bits()));
        }
        if mask.contains(QpAttrMask::AV)
            && attr.ah_attr.sgid_index as u32 >= self.limits.gid_tbl_len
        {
            return invalid(format!("sgid index {} out of range", attr.ah_attr.sgid_index));
        }
        if mask.contains(QpAttrMask::PATH_MTU) && attr.path_mtu > self.limits.active_mtu {
            return invalid(format!(
                "path MTU {:?} exceeds the port's {:?}",
                attr.path_mtu, self.limits.active_mtu
            ));
        }
        if mask.contains(QpAttrMask::DEST_QPN) && attr.dest_qp_num > QPN_MASK {
            return invalid(format!("destination QPN {:#x}", attr.dest_qp_num));
        }
        if (mask.contains(QpAttrMask::RQ_PSN) && attr.rq_psn > PSN_MASK)
            || (mask.contains(QpAttrMask::SQ_PSN) && attr.sq_psn > PSN_MASK)
        {
            return invalid("PSN wider than 24 bits".to_owned());
        }
        if (mask.contains(QpAttrMask::MAX_QP_RD_ATOMIC)
            && attr.max_rd_atomic > self.limits.max_qp_rd_atom)
            || (mask.contains(QpAttrMask::MAX_DEST_RD_ATOMIC)
                && attr.max_dest_rd_atomic > self.limits.max_qp_rd_atom)
        {
            return invalid(format!(
                "outstanding RDMA reads above the limit of {}",
                self.limits.max_qp_rd_atom
            ));
        }
        if (mask.contains(QpAttrMask::RETRY_CNT) && attr.retry_cnt > 7)
            || (mask.contains(QpAttrMask::RNR_RETRY) && attr.rnr_retry > 7)
        {
            return invalid("retry counts are 3-bit values".to_owned());
        }
        if (mask.contains(QpAttrMask::TIMEOUT) && attr.timeout > 31)
            || (mask.contains(QpAttrMask::MIN_RNR_TIMER) && attr.min_rnr_timer > 31)
        {
            return invalid("timers are 5-bit values".to_owned());
        }
        Ok(())
    }

    fn check_send(&self, wr: &SendWr) -> Result<AccessFlags> {
        let invalid = |what: String| Err(Error::InvalidArgument(what));
        if wr.sg_list.len() > self.cap.max_send_sge as usize {
            return invalid(format!(
                "{} SGEs, QP {:#x} takes at most {}",
                wr.sg_list.len(),
                self.qpn,
                self.cap.max_send_sge
            ));
        }
        let access = match (self.qp_type, wr.opcode) {
            (QpType::UD, WrOpcode::Send | WrOpcode::SendWithImm) => {
                if wr.ud.is_none() {
                    return invalid("UD send without a destination".to_owned());
                }
                AccessFlags::empty()
            }
            (QpType::UD, op) => return invalid(format!("{:?} on a UD QP", op)),
            (QpType::RC, WrOpcode::Send | WrOpcode::SendWithImm) => AccessFlags::empty(),
            (QpType::RC, op) => {
                if wr.remote.is_none() {
                    return invalid(format!("{:?} without a remote address", op));
                }
                if op == WrOpcode::RdmaRead {
                    AccessFlags::LOCAL_WRITE
                } else {
                    AccessFlags::empty()
                }
            }
        };
        if wr.send_flags.contains(SendFlags::INLINE) {
            if wr.opcode == WrOpcode::RdmaRead {
                return invalid("RDMA read cannot be inline".to_owned());
            }
            if wr.total_len() > self.cap.max_inline_data as u64 {
                return invalid(format!(
                    "{} inline bytes, QP {:#x} takes at most {}",
                    wr.total_len(),
                    self.qpn,
                    self.cap.max_inline_data
                ));
            }
        } else {
            for sge in &wr.sg_list {
                self.mrs.check_sge(self.pd, sge, access)?;
            }
        }
        if wr.total_len() > u32::MAX as u64 {
            return invalid("message longer than 4 GiB".to_owned());
        }
        Ok(access)
    }

    pub(crate) fn post_send(self: &Arc<Self>, wr: &SendWr, backend: &dyn Backend) -> Result<()> {
        let _post = self.sq_post.lock();
        let seq = {
            let mut inner = self.inner.lock();
            inner.ensure_alive(self.qpn)?;
            if inner.state != QpState::Rts {
                return Err(Error::InvalidState(format!(
                    "post_send needs RTS, QP {:#x} is in {:?}",
                    self.qpn, inner.state
                )));
            }
            let access = self.check_send(wr)?;
            if inner.sq.len() >= self.cap.max_send_wr as usize {
                return Err(Error::ResourceExhausted(format!(
                    "send queue of QP {:#x} is full",
                    self.qpn
                )));
            }
            let seq = inner.next_seq();
            let inline = wr.send_flags.contains(SendFlags::INLINE);
            inner.sq.push_back(PendingWr {
                seq,
                wr_id: wr.wr_id,
                opcode: wr.opcode.into(),
                signaled: self.sq_sig_all || wr.send_flags.contains(SendFlags::SIGNALED),
                sg_list: if inline { Vec::new() } else { wr.sg_list.clone() },
                access,
                byte_len: wr.total_len() as u32,
            });
            seq
        };

        if let Err(e) = backend.post_send(Completer::new(Arc::clone(self)), wr) {
            self.inner.lock().sq.retain(|p| p.seq != seq);
            log::warn!("backend rejected send on QP {:#x}: {}", self.qpn, e);
            return Err(Error::Fault(format!("backend rejected send: {}", e)));
        }
        Ok(())
    }

    pub(crate) fn post_recv(self: &Arc<Self>, wr: &RecvWr, backend: &dyn Backend) -> Result<()> {
        let _post = self.rq_post.lock();
        let seq = {
            let mut inner = self.inner.lock();
            inner.ensure_alive(self.qpn)?;
            if !matches!(inner.state, QpState::Init | QpState::Rtr | QpState::Rts) {
                return Err(Error::InvalidState(format!(
                    "post_recv needs INIT, RTR or RTS, QP {:#x} is in {:?}",
                    self.qpn, inner.state
                )));
            }
            if wr.sg_list.len() > self.cap.max_recv_sge as usize {
                return Err(Error::InvalidArgument(format!(
                    "{} SGEs, QP {:#x} takes at most {}",
                    wr.sg_list.len(),
                    self.qpn,
                    self.cap.max_recv_sge
                )));
            }
            for sge in &wr.sg_list {
                self.mrs.check_sge(self.pd, sge, AccessFlags::LOCAL_WRITE)?;
            }
            if inner.rq.len() >= self.cap.max_recv_wr as usize {
                return Err(Error::ResourceExhausted(format!(
                    "receive queue of QP {:#x} is full",
                    self.qpn
                )));
            }
            let seq = inner.next_seq();
            inner.rq.push_back(PendingWr {
                seq,
                wr_id: wr.wr_id,
                opcode: WcOpcode::Recv,
                signaled: true,
                sg_list: wr.sg_list.clone(),
                access: AccessFlags::LOCAL_WRITE,
                byte_len: wr.total_len().min(u32::MAX as u64) as u32,
            });
            seq
        };

        if let Err(e) = backend.post_recv(Completer::new(Arc::clone(self)), wr) {
            self.inner.lock().rq.retain(|p| p.seq != seq);
            log::warn!("backend rejected receive on QP {:#x}: {}", self.qpn, e);
            return Err(Error::Fault(format!("backend rejected receive: {}", e)));
        }
        Ok(())
    }

    // Keys of the work request must still be live when it completes.
    fn recheck(&self, wr: &PendingWr, status: WcStatus) -> WcStatus {
        if status != WcStatus::Success {
            return status;
        }
        let stale = wr
            .sg_list
            .iter()
            .any(|sge| self.mrs.check_sge(self.pd, sge, wr.access).is_err());
        if stale {
            log::debug!(
                "QP {:#x}, wr_id {}: memory region went away while in flight",
                self.qpn,
                wr.wr_id
            );
            WcStatus::LocalProtectionError
        } else {
            status
        }
    }

    fn completion(&self, wr: &PendingWr, status: WcStatus) -> WorkCompletion {
        WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode: wr.opcode,
            qp_num: self.qpn,
            src_qp: 0,
            vendor_err: 0,
            byte_len: if status == WcStatus::Success {
                wr.byte_len
            } else {
                0
            },
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }

    pub(crate) fn complete_send(&self, status: WcStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_alive(self.qpn)?;
        let wr = inner.sq.pop_front().ok_or_else(|| {
            Error::InvalidState(format!("QP {:#x} has no outstanding send", self.qpn))
        })?;
        let status = self.recheck(&wr, status);
        if wr.signaled || status != WcStatus::Success {
            let wc = self.completion(&wr, status);
            if self.send_cq.push(wc).is_err() {
                self.enter_error(&mut inner);
                return Ok(());
            }
        }
        if status != WcStatus::Success {
            log::debug!("QP {:#x} send failed: {:?}", self.qpn, status);
            match self.qp_type {
                QpType::UD => {
                    inner.state = QpState::Sqe;
                    self.flush(&mut inner, false);
                }
                QpType::RC => self.enter_error(&mut inner),
            }
        }
        Ok(())
    }

    pub(crate) fn complete_recv(
        &self,
        status: WcStatus,
        byte_len: u32,
        imm_data: Option<u32>,
        src_qp: u32,
        solicited: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_alive(self.qpn)?;
        let wr = inner.rq.pop_front().ok_or_else(|| {
            Error::InvalidState(format!("QP {:#x} has no outstanding receive", self.qpn))
        })?;
        let status = if status == WcStatus::Success && byte_len > wr.byte_len {
            WcStatus::LocalLengthError
        } else {
            self.recheck(&wr, status)
        };
        let mut wc = self.completion(&wr, status);
        wc.src_qp = src_qp;
        if status == WcStatus::Success {
            wc.byte_len = byte_len;
            if let Some(imm) = imm_data {
                wc.imm_data = imm;
                wc.wc_flags |= WcFlags::WITH_IMM;
            }
            if solicited {
                wc.wc_flags |= WcFlags::SOLICITED;
            }
        }
        if self.recv_cq.push(wc).is_err() || status != WcStatus::Success {
            self.enter_error(&mut inner);
        }
        Ok(())
    }

    /// Drives the QP to ERROR on behalf of the transport.
    pub(crate) fn fault(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_alive(self.qpn)?;
        self.enter_error(&mut inner);
        Ok(())
    }

    fn enter_error(&self, inner: &mut QpInner) {
        if inner.state != QpState::Error {
            log::debug!("QP {:#x}: {:?} -> Error", self.qpn, inner.state);
        }
        inner.state = QpState::Error;
        self.flush(inner, true);
    }

    // Every outstanding request completes with WrFlushError, signaled or not.
    fn flush(&self, inner: &mut QpInner, recv_too: bool) {
        let mut flushed = 0;
        while let Some(wr) = inner.sq.pop_front() {
            let _ = self.send_cq.push(self.completion(&wr, WcStatus::WrFlushError));
            flushed += 1;
        }
        if recv_too {
            while let Some(wr) = inner.rq.pop_front() {
                let _ = self.recv_cq.push(self.completion(&wr, WcStatus::WrFlushError));
                flushed += 1;
            }
        }
        if flushed > 0 {
            log::debug!("QP {:#x}: flushed {} work request(s)", self.qpn, flushed);
        }
    }

    pub(crate) fn mark_destroyed(&self) {
        let mut inner = self.inner.lock();
        inner.destroyed = true;
        inner.sq.clear();
        inner.rq.clear();
    }
}

fn apply_attr(dst: &mut QpAttr, src: &QpAttr, mask: QpAttrMask) {
    if mask.contains(QpAttrMask::ACCESS_FLAGS) {
        dst.qp_access_flags = src.qp_access_flags;
    }
    if mask.contains(QpAttrMask::PKEY_INDEX) {
        dst.pkey_index = src.pkey_index;
    }
    if mask.contains(QpAttrMask::PORT) {
        dst.port_num = src.port_num;
    }
    if mask.contains(QpAttrMask::QKEY) {
        dst.qkey = src.qkey;
    }
    if mask.contains(QpAttrMask::AV) {
        dst.ah_attr = src.ah_attr.clone();
    }
    if mask.contains(QpAttrMask::PATH_MTU) {
        dst.path_mtu = src.path_mtu;
    }
    if mask.contains(QpAttrMask::TIMEOUT) {
        dst.timeout = src.timeout;
    }
    if mask.contains(QpAttrMask::RETRY_CNT) {
        dst.retry_cnt = src.retry_cnt;
    }
    if mask.contains(QpAttrMask::RNR_RETRY) {
        dst.rnr_retry = src.rnr_retry;
    }
    if mask.contains(QpAttrMask::RQ_PSN) {
        dst.rq_psn = src.rq_psn;
    }
    if mask.contains(QpAttrMask::MAX_QP_RD_ATOMIC) {
        dst.max_rd_atomic = src.max_rd_atomic;
    }
    if mask.contains(QpAttrMask::MIN_RNR_TIMER) {
        dst.min_rnr_timer = src.min_rnr_timer;
    }
    if mask.contains(QpAttrMask::SQ_PSN) {
        dst.sq_psn = src.sq_psn;
    }
    if mask.contains(QpAttrMask::MAX_DEST_RD_ATOMIC) {
        dst.max_dest_rd_atomic = src.max_dest_rd_atomic;
    }
    if mask.contains(QpAttrMask::DEST_QPN) {
        dst.dest_qp_num = src.dest_qp_num;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qpn_layout() {
        let alloc = QpnAllocator::new(4);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        let c = alloc.alloc().unwrap();
        assert_eq!(qpn_index(a), 1);
        assert_eq!(qpn_index(b), 2);
        assert_eq!(qpn_index(c), 3);
        assert!(a <= QPN_MASK && c <= QPN_MASK);
        assert!(alloc.alloc().is_none());
        alloc.free(b);
        assert_eq!(qpn_index(alloc.alloc().unwrap()), 2);
    }

    #[test]
    #[should_panic(expected = "freed but not allocated")]
    fn double_free_is_fatal() {
        let alloc = QpnAllocator::new(4);
        let a = alloc.alloc().unwrap();
        alloc.free(a);
        alloc.free(a);
    }

    #[test]
    fn attr_mask_selects_fields() {
        let mut dst = QpAttr::default();
        let src = QpAttr {
            dest_qp_num: 0x42,
            rq_psn: 7,
            sq_psn: 9,
            ..Default::default()
        };
        apply_attr(&mut dst, &src, QpAttrMask::DEST_QPN | QpAttrMask::RQ_PSN);
        assert_eq!(dst.dest_qp_num, 0x42);
        assert_eq!(dst.rq_psn, 7);
        assert_eq!(dst.sq_psn, 0);
    }
}
