//! Control path commands.
use serde::{Deserialize, Serialize};

use crate::gid::{Gid, GidAttr};
use crate::net;
use crate::net::returned;
use crate::net::{AccessFlags, DeviceAttr, PortAttr, QpAttr, QpAttrMask, QpInitAttr};

type IResult<T> = Result<T, crate::Error>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    // devices and contexts
    GetDeviceList,
    OpenDevice(net::Device),
    CloseDevice(net::Context),
    QueryDevice(net::Context),
    QueryPort(net::Context, u8),
    QueryPkey(net::Context, u8, u16),

    // gid table
    QueryGid(net::Context, u8, u32),
    AddGid(net::Context, u32, Gid, GidAttr),
    DelGid(net::Context, u32),

    // ibverbs
    AllocPd(net::Context),
    CreateCq(net::Context, u32),
    ReqNotifyCq(net::CompletionQueue, bool),
    CreateQp(net::ProtectionDomain, QpInitAttr),
    ModifyQp(net::QueuePair, QpAttr, QpAttrMask),
    QueryQp(net::QueuePair),
    RegMr(net::ProtectionDomain, u64, u64, AccessFlags),

    DeallocPd(net::ProtectionDomain),
    DestroyCq(net::CompletionQueue),
    DestroyQp(net::QueuePair),
    DeregMr(net::MemoryRegion),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CompletionKind {
    GetDeviceList(Vec<returned::DeviceInfo>),
    OpenDevice(returned::Context),
    CloseDevice,
    QueryDevice(DeviceAttr),
    QueryPort(PortAttr),
    QueryPkey(u16),

    QueryGid(Gid),
    AddGid,
    DelGid,

    AllocPd(returned::ProtectionDomain),
    CreateCq(returned::CompletionQueue),
    ReqNotifyCq,
    CreateQp(returned::QueuePair),
    ModifyQp,
    QueryQp(QpAttr, QpInitAttr),
    RegMr(returned::MemoryRegion),

    DeallocPd,
    DestroyCq,
    DestroyQp,
    DeregMr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Completion(pub IResult<CompletionKind>);
