//! Device contexts.
//!
//! A context owns the PDs, CQs, QPs and MRs created through it. `close` refuses to run while any
//! of them is alive. A context that is dropped without being closed (its caller went away)
//! destroys what it still owns in reverse dependency order.
use std::sync::Arc;

use spin::{RwLock, RwLockReadGuard};

use bluerdma_api::gid::{Gid, GidAttr};
use bluerdma_api::net::{
    AccessFlags, DeviceAttr, PortAttr, QpAttr, QpAttrMask, QpInitAttr, RecvWr, SendWr,
    WorkCompletion,
};
use bluerdma_api::Handle;

use crate::backend::Backend;
use crate::cq::CompletionQueue;
use crate::device::Device;
use crate::log;
use crate::mr::{MemoryRegion, MrBinding};
use crate::pd::ProtectionDomain;
use crate::qp::{QpParams, QueuePair};
use crate::resource::{HandleAllocator, ResourceTable};
use crate::verbs::{CqVerbs, DeviceVerbs, GidVerbs, MrVerbs, PdVerbs, QpVerbs};
use crate::{Error, Result};

#[derive(Debug)]
pub struct Context {
    handles: HandleAllocator,
    device: Arc<Device>,
    backend: Arc<dyn Backend>,
    // Creators hold it for read from the open check to the insert, close takes it for write.
    closed: RwLock<bool>,
    pds: ResourceTable<ProtectionDomain>,
    cqs: ResourceTable<CompletionQueue>,
    qps: ResourceTable<QueuePair>,
    mrs: ResourceTable<MemoryRegion>,
}

impl Context {
    pub(crate) fn new(device: Arc<Device>, backend: Arc<dyn Backend>, id: u32) -> Self {
        Context {
            handles: HandleAllocator::new(id),
            device,
            backend,
            closed: RwLock::new(false),
            pds: ResourceTable::default(),
            cqs: ResourceTable::default(),
            qps: ResourceTable::default(),
            mrs: ResourceTable::default(),
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handles.owner()
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn closed_error(&self) -> Error {
        Error::InvalidState(format!("context {:?} is closed", self.handle()))
    }

    fn ensure_open(&self) -> Result<()> {
        self.open_guard().map(|_| ())
    }

    fn open_guard(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let closed = self.closed.read();
        if *closed {
            Err(self.closed_error())
        } else {
            Ok(closed)
        }
    }

    fn alloc_handle(&self) -> Result<Handle> {
        Ok(self.handles.alloc()?)
    }

    pub fn pd(&self, pd: Handle) -> Result<Arc<ProtectionDomain>> {
        Ok(self.pds.get(&pd)?)
    }

    pub fn cq(&self, cq: Handle) -> Result<Arc<CompletionQueue>> {
        Ok(self.cqs.get(&cq)?)
    }

    pub fn qp(&self, qp: Handle) -> Result<Arc<QueuePair>> {
        Ok(self.qps.get(&qp)?)
    }

    pub fn mr(&self, mr: Handle) -> Result<Arc<MemoryRegion>> {
        Ok(self.mrs.get(&mr)?)
    }

    /// Number of PDs, CQs, QPs and MRs still owned.
    pub fn owned(&self) -> usize {
        self.pds.len() + self.cqs.len() + self.qps.len() + self.mrs.len()
    }

    /// Ends the session. Fails with `Busy` while the context owns any object.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.write();
        if *closed {
            return Err(self.closed_error());
        }
        if self.owned() > 0 {
            return Err(Error::Busy(format!(
                "context {:?} still owns {} PD(s), {} CQ(s), {} QP(s) and {} MR(s)",
                self.handle(),
                self.pds.len(),
                self.cqs.len(),
                self.qps.len(),
                self.mrs.len()
            )));
        }
        *closed = true;
        drop(closed);
        self.device.context_closed();
        log::debug!("CloseDevice, ctx: {:?}", self.handle());
        Ok(())
    }

    fn teardown(&self) {
        let mut leaked = 0;
        for mr in self.mrs.keys() {
            leaked += 1;
            if let Err(e) = self.dereg_mr(mr) {
                log::error!("teardown: dereg_mr {:?}: {}", mr, e);
            }
        }
        for qp in self.qps.keys() {
            leaked += 1;
            if let Err(e) = self.destroy_qp(qp) {
                log::error!("teardown: destroy_qp {:?}: {}", qp, e);
            }
        }
        for cq in self.cqs.keys() {
            leaked += 1;
            if let Err(e) = self.destroy_cq(cq) {
                log::error!("teardown: destroy_cq {:?}: {}", cq, e);
            }
        }
        for pd in self.pds.keys() {
            leaked += 1;
            if let Err(e) = self.dealloc_pd(pd) {
                log::error!("teardown: dealloc_pd {:?}: {}", pd, e);
            }
        }
        if leaked > 0 {
            log::warn!(
                "context {:?} dropped without close, destroyed {} object(s)",
                self.handle(),
                leaked
            );
        }
    }

    fn insert_pd(&self) -> Result<Arc<ProtectionDomain>> {
        let handle = self.alloc_handle()?;
        Ok(self.pds.insert(handle, ProtectionDomain::new(handle))?)
    }

    fn insert_cq(&self, capacity: usize) -> Result<Arc<CompletionQueue>> {
        let handle = self.alloc_handle()?;
        Ok(self
            .cqs
            .insert(handle, CompletionQueue::new(handle, capacity))?)
    }

    fn insert_qp(
        &self,
        pd: Handle,
        init_attr: &QpInitAttr,
        send_cq: Arc<CompletionQueue>,
        recv_cq: Arc<CompletionQueue>,
    ) -> Result<Arc<QueuePair>> {
        let qpn = self.device.qpns.alloc().ok_or_else(|| {
            Error::ResourceExhausted(format!("{} has no free QPN", self.device.name()))
        })?;
        let handle = match self.alloc_handle() {
            Ok(handle) => handle,
            Err(e) => {
                self.device.qpns.free(qpn);
                return Err(e);
            }
        };
        let qp = QueuePair::new(QpParams {
            handle,
            qpn,
            pd,
            init_attr: init_attr.clone(),
            send_cq,
            recv_cq,
            mrs: Arc::clone(&self.device.mrs),
            limits: self.device.qp_limits(),
        });
        // handles are fresh, so the insert cannot collide
        Ok(self.qps.insert(handle, qp)?)
    }

    fn insert_mr(&self, binding: MrBinding) -> Result<Arc<MemoryRegion>> {
        let keys = self.device.mrs.register(binding)?;
        let handle = match self.alloc_handle() {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.device.mrs.deregister(keys.lkey);
                return Err(e);
            }
        };
        Ok(self
            .mrs
            .insert(handle, MemoryRegion::new(handle, binding, keys))?)
    }

    // Undoes the use counts a QP holds on its PD and CQs.
    fn release_qp_refs(&self, pd: &Handle, send_cq: Option<&Handle>, recv_cq: Option<&Handle>) {
        let _ = self.pds.release(pd);
        if let Some(cq) = send_cq {
            let _ = self.cqs.release(cq);
        }
        if let Some(cq) = recv_cq {
            let _ = self.cqs.release(cq);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !*self.closed.get_mut() {
            self.teardown();
            *self.closed.get_mut() = true;
            self.device.context_closed();
        }
    }
}

impl DeviceVerbs for Context {
    fn query_device(&self) -> Result<DeviceAttr> {
        self.ensure_open()?;
        Ok(self.device.query_device())
    }

    fn query_port(&self, port_num: u8) -> Result<PortAttr> {
        self.ensure_open()?;
        self.device.query_port(port_num)
    }

    fn query_pkey(&self, port_num: u8, index: u16) -> Result<u16> {
        self.ensure_open()?;
        self.device.query_pkey(port_num, index)
    }

    fn query_gid(&self, port_num: u8, index: u32) -> Result<Gid> {
        self.ensure_open()?;
        self.device.query_gid(port_num, index)
    }
}

impl GidVerbs for Context {
    fn add_gid(&self, index: u32, gid: Gid, attr: GidAttr) -> Result<()> {
        self.ensure_open()?;
        self.device.add_gid(index, gid, attr)
    }

    fn del_gid(&self, index: u32) -> Result<()> {
        self.ensure_open()?;
        self.device.del_gid(index)
    }
}

impl PdVerbs for Context {
    fn alloc_pd(&self) -> Result<Arc<ProtectionDomain>> {
        let _open = self.open_guard()?;
        self.device.pds.acquire()?;
        match self.insert_pd() {
            Ok(pd) => {
                log::debug!("AllocPd, ctx: {:?}, pd: {:?}", self.handle(), pd.handle());
                Ok(pd)
            }
            Err(e) => {
                self.device.pds.release();
                Err(e)
            }
        }
    }

    fn dealloc_pd(&self, pd: Handle) -> Result<()> {
        log::debug!("DeallocPd, pd: {:?}", pd);
        self.pds.remove(&pd)?;
        self.device.pds.release();
        Ok(())
    }
}

impl CqVerbs for Context {
    fn create_cq(&self, capacity: u32) -> Result<Arc<CompletionQueue>> {
        let _open = self.open_guard()?;
        let max_cqe = self.device.config().max_cqe;
        if capacity == 0 || capacity > max_cqe {
            return Err(Error::InvalidArgument(format!(
                "CQ capacity {} out of range [1, {}]",
                capacity, max_cqe
            )));
        }
        self.device.cqs.acquire()?;
        match self.insert_cq(capacity as usize) {
            Ok(cq) => {
                log::debug!(
                    "CreateCq, ctx: {:?}, cq: {:?}, capacity: {}",
                    self.handle(),
                    cq.handle(),
                    capacity
                );
                Ok(cq)
            }
            Err(e) => {
                self.device.cqs.release();
                Err(e)
            }
        }
    }

    fn destroy_cq(&self, cq: Handle) -> Result<()> {
        log::debug!("DestroyCq, cq: {:?}", cq);
        self.cqs.remove(&cq)?;
        self.device.cqs.release();
        Ok(())
    }

    fn poll_cq(
        &self,
        cq: Handle,
        max_entries: usize,
        wc: &mut Vec<WorkCompletion>,
    ) -> Result<usize> {
        self.cqs.get(&cq)?.poll(max_entries, wc)
    }

    fn req_notify_cq(&self, cq: Handle, solicited_only: bool) -> Result<()> {
        self.cqs.get(&cq)?.req_notify(solicited_only);
        Ok(())
    }
}

impl QpVerbs for Context {
    fn create_qp(&self, pd: Handle, init_attr: &QpInitAttr) -> Result<Arc<QueuePair>> {
        let _open = self.open_guard()?;
        log::debug!("CreateQp, pd: {:?}, init_attr: {:?}", pd, init_attr);
        let config = self.device.config();
        let cap = &init_attr.cap;
        if cap.max_send_wr > config.max_qp_wr
            || cap.max_recv_wr > config.max_qp_wr
            || cap.max_send_sge > config.max_sge
            || cap.max_recv_sge > config.max_sge
            || cap.max_inline_data > config.max_inline_data
        {
            return Err(Error::InvalidArgument(format!(
                "QP capabilities {:?} exceed the device limits",
                cap
            )));
        }

        let send_cq_handle = init_attr.send_cq.0;
        let recv_cq_handle = init_attr.recv_cq.0;
        self.pds.acquire(&pd)?;
        let send_cq = match self.cqs.acquire(&send_cq_handle) {
            Ok(cq) => cq,
            Err(e) => {
                self.release_qp_refs(&pd, None, None);
                return Err(e.into());
            }
        };
        let recv_cq = match self.cqs.acquire(&recv_cq_handle) {
            Ok(cq) => cq,
            Err(e) => {
                self.release_qp_refs(&pd, Some(&send_cq_handle), None);
                return Err(e.into());
            }
        };

        match self.insert_qp(pd, init_attr, send_cq, recv_cq) {
            Ok(qp) => {
                log::debug!("CreateQp, qp: {:?}, qpn: {:#x}", qp.handle(), qp.qpn());
                Ok(qp)
            }
            Err(e) => {
                self.release_qp_refs(&pd, Some(&send_cq_handle), Some(&recv_cq_handle));
                Err(e)
            }
        }
    }

    fn destroy_qp(&self, qp: Handle) -> Result<()> {
        log::debug!("DestroyQp, qp: {:?}", qp);
        let qp = self.qps.remove(&qp)?;
        qp.mark_destroyed();
        self.backend.qp_destroyed(qp.qpn());
        self.device.qpns.free(qp.qpn());
        self.release_qp_refs(
            &qp.pd(),
            Some(&qp.send_cq().handle()),
            Some(&qp.recv_cq().handle()),
        );
        Ok(())
    }

    fn query_qp(&self, qp: Handle) -> Result<(QpAttr, QpInitAttr)> {
        Ok(self.qps.get(&qp)?.query())
    }

    fn modify_qp(&self, qp: Handle, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        let qp = self.qps.get(&qp)?;
        let state = qp.modify(attr, mask)?;
        self.backend.qp_modified(qp.qpn(), state);
        Ok(())
    }

    fn post_send(&self, qp: Handle, wr: &SendWr) -> Result<()> {
        self.qps.get(&qp)?.post_send(wr, &*self.backend)
    }

    fn post_recv(&self, qp: Handle, wr: &RecvWr) -> Result<()> {
        self.qps.get(&qp)?.post_recv(wr, &*self.backend)
    }
}

impl MrVerbs for Context {
    fn reg_mr(
        &self,
        pd: Handle,
        addr: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<Arc<MemoryRegion>> {
        let _open = self.open_guard()?;
        log::debug!(
            "RegMr, pd: {:?}, addr: {:#x}, length: {}, access: {:?}",
            pd,
            addr,
            length,
            access
        );
        if length == 0 {
            return Err(Error::InvalidArgument("zero-length memory region".to_owned()));
        }
        if addr.checked_add(length).is_none() {
            return Err(Error::InvalidArgument(format!(
                "region [{:#x}, +{}) wraps around",
                addr, length
            )));
        }
        if !AccessFlags::all().contains(access) {
            return Err(Error::InvalidArgument(format!(
                "malformed access flags {:#x}",
                access.bits()
            )));
        }

        self.pds.acquire(&pd)?;
        let binding = MrBinding {
            pd,
            addr,
            length,
            access,
        };
        match self.insert_mr(binding) {
            Ok(mr) => {
                log::debug!(
                    "RegMr, mr: {:?}, lkey: {:#x}, rkey: {:#x}",
                    mr.handle(),
                    mr.lkey(),
                    mr.rkey()
                );
                Ok(mr)
            }
            Err(e) => {
                let _ = self.pds.release(&pd);
                Err(e)
            }
        }
    }

    fn dereg_mr(&self, mr: Handle) -> Result<()> {
        log::debug!("DeregMr, mr: {:?}", mr);
        let region = self.mrs.get(&mr)?;
        // keys die before the handle does
        self.device.mrs.deregister(region.lkey())?;
        self.mrs.remove(&mr)?;
        let _ = self.pds.release(&region.pd());
        Ok(())
    }
}
