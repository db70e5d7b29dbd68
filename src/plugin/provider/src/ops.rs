//! The verbs on typed handles, as seen by one client process.
//!
//! Context handles are looked up in the process's own table. Every other handle carries its
//! context in the owner bits, so a handle forged from another process's context never resolves.
use std::sync::Arc;

use nix::unistd::Pid;

use bluerdma::api::cmd::{self, Command, CompletionKind};
use bluerdma::api::dp::{self, WorkRequest};
use bluerdma::api::gid::{Gid, GidAttr};
use bluerdma::api::net::{self, returned};
use bluerdma::api::net::{
    AccessFlags, DeviceAttr, PortAttr, PortState, QpAttr, QpAttrMask, QpInitAttr, RecvWr, SendWr,
    WorkCompletion,
};
use bluerdma::api::wire::{Reply, Request};
use bluerdma::device::PORT_NUM;
use bluerdma::log;
use bluerdma::verbs::{CqVerbs, DeviceVerbs, GidVerbs, MrVerbs, PdVerbs, QpVerbs};
use bluerdma::{Context, Device};

use crate::state::{Resource, State};
use crate::ApiError;

pub type Result<T> = std::result::Result<T, ApiError>;

pub struct Ops {
    pub(crate) state: State,
}

impl Clone for Ops {
    fn clone(&self) -> Self {
        let shared = Arc::clone(&self.state.shared);
        let state = State::new(shared);
        Ops { state }
    }
}

impl Ops {
    pub(crate) fn new(state: State) -> Self {
        Self { state }
    }

    #[inline]
    pub fn resource(&self) -> &Resource {
        self.state.resource()
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.state.shared.pid
    }

    #[inline]
    fn context(&self, ctx: &net::Context) -> Result<Arc<Context>> {
        self.resource().context(ctx.0)
    }
}

fn device_info(device: &Device) -> returned::DeviceInfo {
    returned::DeviceInfo {
        handle: net::Device(device.handle()),
        name: device.name().to_owned(),
        node_guid: device.node_guid(),
        hw_addr: device.hw_addr(),
        port_state: device
            .query_port(PORT_NUM)
            .map(|p| p.state)
            .unwrap_or(PortState::Down),
    }
}

// Datapath APIs
impl Ops {
    pub fn post_send(&self, qp: &net::QueuePair, wr: &SendWr) -> Result<()> {
        let ctx = self.resource().owner_of(qp.0)?;
        Ok(ctx.post_send(qp.0, wr)?)
    }

    pub fn post_recv(&self, qp: &net::QueuePair, wr: &RecvWr) -> Result<()> {
        let ctx = self.resource().owner_of(qp.0)?;
        Ok(ctx.post_recv(qp.0, wr)?)
    }

    /// Appends at most `max_entries` completions to `wc`.
    pub fn poll_cq(
        &self,
        cq: &net::CompletionQueue,
        max_entries: usize,
        wc: &mut Vec<WorkCompletion>,
    ) -> Result<usize> {
        let ctx = self.resource().owner_of(cq.0)?;
        Ok(ctx.poll_cq(cq.0, max_entries, wc)?)
    }
}

// Control path APIs
impl Ops {
    pub fn get_device_list(&self) -> Vec<returned::DeviceInfo> {
        log::debug!("GetDeviceList, pid: {}", self.pid());
        self.resource()
            .registry
            .devices()
            .iter()
            .map(|d| device_info(d))
            .collect()
    }

    pub fn open_device(&self, device: &net::Device) -> Result<returned::Context> {
        log::debug!("OpenDevice, pid: {}, device: {:?}", self.pid(), device);
        let ctx = self.resource().registry.get(device.0)?.open()?;
        let handle = self.resource().insert_context(ctx);
        Ok(returned::Context {
            handle: net::Context(handle),
            device: *device,
        })
    }

    pub fn close_device(&self, ctx: &net::Context) -> Result<()> {
        log::debug!("CloseDevice, pid: {}, ctx: {:?}", self.pid(), ctx);
        self.context(ctx)?.close()?;
        self.resource().remove_context(ctx.0);
        Ok(())
    }

    pub fn query_device(&self, ctx: &net::Context) -> Result<DeviceAttr> {
        Ok(self.context(ctx)?.query_device()?)
    }

    pub fn query_port(&self, ctx: &net::Context, port_num: u8) -> Result<PortAttr> {
        Ok(self.context(ctx)?.query_port(port_num)?)
    }

    pub fn query_pkey(&self, ctx: &net::Context, port_num: u8, index: u16) -> Result<u16> {
        Ok(self.context(ctx)?.query_pkey(port_num, index)?)
    }

    pub fn query_gid(&self, ctx: &net::Context, port_num: u8, index: u32) -> Result<Gid> {
        Ok(self.context(ctx)?.query_gid(port_num, index)?)
    }

    pub fn add_gid(&self, ctx: &net::Context, index: u32, gid: Gid, attr: GidAttr) -> Result<()> {
        Ok(self.context(ctx)?.add_gid(index, gid, attr)?)
    }

    pub fn del_gid(&self, ctx: &net::Context, index: u32) -> Result<()> {
        Ok(self.context(ctx)?.del_gid(index)?)
    }

    pub fn alloc_pd(&self, ctx: &net::Context) -> Result<returned::ProtectionDomain> {
        let pd = self.context(ctx)?.alloc_pd()?;
        Ok(returned::ProtectionDomain {
            handle: net::ProtectionDomain(pd.handle()),
        })
    }

    pub fn dealloc_pd(&self, pd: &net::ProtectionDomain) -> Result<()> {
        Ok(self.resource().owner_of(pd.0)?.dealloc_pd(pd.0)?)
    }

    pub fn create_cq(&self, ctx: &net::Context, capacity: u32) -> Result<returned::CompletionQueue> {
        let cq = self.context(ctx)?.create_cq(capacity)?;
        Ok(returned::CompletionQueue {
            handle: net::CompletionQueue(cq.handle()),
            capacity,
        })
    }

    pub fn destroy_cq(&self, cq: &net::CompletionQueue) -> Result<()> {
        Ok(self.resource().owner_of(cq.0)?.destroy_cq(cq.0)?)
    }

    pub fn req_notify_cq(&self, cq: &net::CompletionQueue, solicited_only: bool) -> Result<()> {
        Ok(self
            .resource()
            .owner_of(cq.0)?
            .req_notify_cq(cq.0, solicited_only)?)
    }

    pub fn create_qp(
        &self,
        pd: &net::ProtectionDomain,
        init_attr: &QpInitAttr,
    ) -> Result<returned::QueuePair> {
        let qp = self.resource().owner_of(pd.0)?.create_qp(pd.0, init_attr)?;
        Ok(returned::QueuePair {
            handle: net::QueuePair(qp.handle()),
            qp_num: qp.qpn(),
            pd: *pd,
            send_cq: init_attr.send_cq,
            recv_cq: init_attr.recv_cq,
        })
    }

    pub fn modify_qp(&self, qp: &net::QueuePair, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        Ok(self.resource().owner_of(qp.0)?.modify_qp(qp.0, attr, mask)?)
    }

    pub fn query_qp(&self, qp: &net::QueuePair) -> Result<(QpAttr, QpInitAttr)> {
        Ok(self.resource().owner_of(qp.0)?.query_qp(qp.0)?)
    }

    pub fn destroy_qp(&self, qp: &net::QueuePair) -> Result<()> {
        Ok(self.resource().owner_of(qp.0)?.destroy_qp(qp.0)?)
    }

    pub fn reg_mr(
        &self,
        pd: &net::ProtectionDomain,
        addr: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<returned::MemoryRegion> {
        let mr = self
            .resource()
            .owner_of(pd.0)?
            .reg_mr(pd.0, addr, length, access)?;
        Ok(returned::MemoryRegion {
            handle: net::MemoryRegion(mr.handle()),
            addr: mr.addr(),
            length: mr.len(),
            lkey: mr.lkey(),
            rkey: mr.rkey(),
        })
    }

    pub fn dereg_mr(&self, mr: &net::MemoryRegion) -> Result<()> {
        Ok(self.resource().owner_of(mr.0)?.dereg_mr(mr.0)?)
    }
}

// Command dispatch
impl Ops {
    fn process_cmd(&self, req: &Command) -> Result<CompletionKind> {
        match req {
            Command::GetDeviceList => Ok(CompletionKind::GetDeviceList(self.get_device_list())),
            Command::OpenDevice(device) => self.open_device(device).map(CompletionKind::OpenDevice),
            Command::CloseDevice(ctx) => self.close_device(ctx).map(|_| CompletionKind::CloseDevice),
            Command::QueryDevice(ctx) => self.query_device(ctx).map(CompletionKind::QueryDevice),
            Command::QueryPort(ctx, port_num) => self
                .query_port(ctx, *port_num)
                .map(CompletionKind::QueryPort),
            Command::QueryPkey(ctx, port_num, index) => self
                .query_pkey(ctx, *port_num, *index)
                .map(CompletionKind::QueryPkey),
            Command::QueryGid(ctx, port_num, index) => self
                .query_gid(ctx, *port_num, *index)
                .map(CompletionKind::QueryGid),
            Command::AddGid(ctx, index, gid, attr) => self
                .add_gid(ctx, *index, *gid, attr.clone())
                .map(|_| CompletionKind::AddGid),
            Command::DelGid(ctx, index) => self.del_gid(ctx, *index).map(|_| CompletionKind::DelGid),
            Command::AllocPd(ctx) => self.alloc_pd(ctx).map(CompletionKind::AllocPd),
            Command::CreateCq(ctx, capacity) => {
                self.create_cq(ctx, *capacity).map(CompletionKind::CreateCq)
            }
            Command::ReqNotifyCq(cq, solicited_only) => self
                .req_notify_cq(cq, *solicited_only)
                .map(|_| CompletionKind::ReqNotifyCq),
            Command::CreateQp(pd, init_attr) => {
                self.create_qp(pd, init_attr).map(CompletionKind::CreateQp)
            }
            Command::ModifyQp(qp, attr, mask) => self
                .modify_qp(qp, attr, *mask)
                .map(|_| CompletionKind::ModifyQp),
            Command::QueryQp(qp) => self
                .query_qp(qp)
                .map(|(attr, init_attr)| CompletionKind::QueryQp(attr, init_attr)),
            Command::RegMr(pd, addr, length, access) => self
                .reg_mr(pd, *addr, *length, *access)
                .map(CompletionKind::RegMr),
            Command::DeallocPd(pd) => self.dealloc_pd(pd).map(|_| CompletionKind::DeallocPd),
            Command::DestroyCq(cq) => self.destroy_cq(cq).map(|_| CompletionKind::DestroyCq),
            Command::DestroyQp(qp) => self.destroy_qp(qp).map(|_| CompletionKind::DestroyQp),
            Command::DeregMr(mr) => self.dereg_mr(mr).map(|_| CompletionKind::DeregMr),
        }
    }

    /// Runs one control path command.
    pub fn dispatch(&self, req: &Command) -> cmd::Completion {
        let result = self.process_cmd(req);
        if let Err(e) = &result {
            log::debug!("pid: {}, {:?} failed: {}", self.pid(), req, e);
        }
        cmd::Completion(result.map_err(Into::into))
    }

    fn process_dp(&self, req: &WorkRequest) -> Result<dp::CompletionKind> {
        match req {
            WorkRequest::PostSend(qp, wr) => {
                self.post_send(qp, wr).map(|_| dp::CompletionKind::PostSend)
            }
            WorkRequest::PostRecv(qp, wr) => {
                self.post_recv(qp, wr).map(|_| dp::CompletionKind::PostRecv)
            }
            WorkRequest::PollCq(cq, max_entries) => {
                let mut wc = Vec::new();
                self.poll_cq(cq, *max_entries as usize, &mut wc)?;
                Ok(dp::CompletionKind::PollCq(wc))
            }
        }
    }

    /// Runs one data path request.
    pub fn dispatch_dp(&self, req: &WorkRequest) -> dp::Completion {
        dp::Completion(self.process_dp(req).map_err(Into::into))
    }

    /// Decodes a bincode [`Request`], runs it and returns the encoded [`Reply`].
    pub fn handle_encoded(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let req: Request = bincode::deserialize(buf)?;
        let reply = match &req {
            Request::Cmd(command) => Reply::Cmd(self.dispatch(command)),
            Request::Dp(wr) => Reply::Dp(self.dispatch_dp(wr)),
        };
        Ok(bincode::serialize(&reply)?)
    }
}
