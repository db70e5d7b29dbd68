//! Verbs grouped by the resource they act on.
//!
//! [`Context`](crate::Context) implements every trait here. [`GidVerbs`] is the optional part:
//! a frontend that only consumes addresses needs the query in [`DeviceVerbs`] alone.
use std::sync::Arc;

use bluerdma_api::gid::{Gid, GidAttr};
use bluerdma_api::net::{
    AccessFlags, DeviceAttr, PortAttr, QpAttr, QpAttrMask, QpInitAttr, RecvWr, SendWr,
    WorkCompletion,
};
use bluerdma_api::Handle;

use crate::cq::CompletionQueue;
use crate::mr::MemoryRegion;
use crate::pd::ProtectionDomain;
use crate::qp::QueuePair;
use crate::Result;

pub trait DeviceVerbs {
    fn query_device(&self) -> Result<DeviceAttr>;

    fn query_port(&self, port_num: u8) -> Result<PortAttr>;

    fn query_pkey(&self, port_num: u8, index: u16) -> Result<u16>;

    fn query_gid(&self, port_num: u8, index: u32) -> Result<Gid>;
}

pub trait GidVerbs {
    fn add_gid(&self, index: u32, gid: Gid, attr: GidAttr) -> Result<()>;

    fn del_gid(&self, index: u32) -> Result<()>;
}

pub trait PdVerbs {
    fn alloc_pd(&self) -> Result<Arc<ProtectionDomain>>;

    /// Fails with `Busy` while QPs or MRs of the PD exist.
    fn dealloc_pd(&self, pd: Handle) -> Result<()>;
}

pub trait CqVerbs {
    fn create_cq(&self, capacity: u32) -> Result<Arc<CompletionQueue>>;

    /// Fails with `Busy` while QPs are bound to the CQ.
    fn destroy_cq(&self, cq: Handle) -> Result<()>;

    /// Appends at most `max_entries` completions to `wc` and returns how many it appended.
    fn poll_cq(&self, cq: Handle, max_entries: usize, wc: &mut Vec<WorkCompletion>)
        -> Result<usize>;

    fn req_notify_cq(&self, cq: Handle, solicited_only: bool) -> Result<()>;
}

pub trait QpVerbs {
    fn create_qp(&self, pd: Handle, init_attr: &QpInitAttr) -> Result<Arc<QueuePair>>;

    fn destroy_qp(&self, qp: Handle) -> Result<()>;

    fn query_qp(&self, qp: Handle) -> Result<(QpAttr, QpInitAttr)>;

    fn modify_qp(&self, qp: Handle, attr: &QpAttr, mask: QpAttrMask) -> Result<()>;

    fn post_send(&self, qp: Handle, wr: &SendWr) -> Result<()>;

    fn post_recv(&self, qp: Handle, wr: &RecvWr) -> Result<()>;
}

pub trait MrVerbs {
    fn reg_mr(
        &self,
        pd: Handle,
        addr: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<Arc<MemoryRegion>>;

    fn dereg_mr(&self, mr: Handle) -> Result<()>;
}
