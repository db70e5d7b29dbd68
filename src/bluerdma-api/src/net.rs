//! Verbs object handles and attribute types.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::gid::{Gid, MacAddr};
use crate::{AsHandle, Handle};

macro_rules! handle_type {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
            pub struct $name(pub Handle);

            impl AsHandle for $name {
                #[inline]
                fn as_handle(&self) -> Handle {
                    self.0
                }
            }
        )*
    };
}

handle_type!(
    Device,
    Context,
    ProtectionDomain,
    CompletionQueue,
    QueuePair,
    MemoryRegion,
);

pub mod returned {
    use serde::{Deserialize, Serialize};

    use crate::gid::MacAddr;

    use super::PortState;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DeviceInfo {
        pub handle: super::Device,
        pub name: String,
        pub node_guid: u64,
        pub hw_addr: MacAddr,
        pub port_state: PortState,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Context {
        pub handle: super::Context,
        pub device: super::Device,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProtectionDomain {
        pub handle: super::ProtectionDomain,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CompletionQueue {
        pub handle: super::CompletionQueue,
        pub capacity: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct QueuePair {
        pub handle: super::QueuePair,
        pub qp_num: u32,
        pub pd: super::ProtectionDomain,
        pub send_cq: super::CompletionQueue,
        pub recv_cq: super::CompletionQueue,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MemoryRegion {
        pub handle: super::MemoryRegion,
        pub addr: u64,
        pub length: u64,
        pub lkey: u32,
        pub rkey: u32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Down,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysPortState {
    Disabled,
    LinkUp,
}

/// Path MTU, encoded like the verbs `ibv_mtu` enumeration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    #[default]
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    /// The largest path MTU that fits in a link of `bytes`.
    pub fn from_bytes(bytes: u32) -> Self {
        match bytes {
            b if b >= 4096 => Mtu::Mtu4096,
            b if b >= 2048 => Mtu::Mtu2048,
            b if b >= 1024 => Mtu::Mtu1024,
            b if b >= 512 => Mtu::Mtu512,
            _ => Mtu::Mtu256,
        }
    }

    #[inline]
    pub fn bytes(&self) -> u32 {
        128 << (*self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAttr {
    pub state: PortState,
    pub phys_state: PhysPortState,
    pub max_mtu: Mtu,
    pub active_mtu: Mtu,
    pub gid_tbl_len: u32,
    pub pkey_tbl_len: u16,
    pub lid: u16,
    pub max_msg_sz: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttr {
    pub fw_ver: String,
    pub node_guid: u64,
    pub sys_image_guid: u64,
    pub hw_addr: MacAddr,
    pub vendor_id: u32,
    pub vendor_part_id: u32,
    pub max_mr_size: u64,
    pub max_qp: u32,
    pub max_qp_wr: u32,
    pub max_sge: u32,
    pub max_cq: u32,
    pub max_cqe: u32,
    pub max_mr: u32,
    pub max_pd: u32,
    pub max_qp_rd_atom: u8,
    pub max_inline_data: u32,
    pub phys_port_cnt: u8,
}

bitflags! {
    /// Access permissions of a memory region or of the remote side of a QP.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
    }

    /// Selects the fields of a `QpAttr` a `modify_qp` call carries. Bit values follow
    /// `ibv_qp_attr_mask`.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const CUR_STATE = 1 << 1;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const QKEY = 1 << 6;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const DEST_QPN = 1 << 20;
    }

    /// Flags of the completed WR.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
        /// The sender asked for a solicited event.
        const SOLICITED = 0b00000100;
    }

    /// Flags of the WR properties.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator. Valid only for QPs with Transport Service Type RC.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator. Relevant only if QP was created with
        /// sq_sig_all=0.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator. Valid only for Send and RDMA Write with immediate.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data in a send WQE.  Valid only for Send and
        /// RDMA Write.  The L_Key will not be checked.
        const INLINE = 0b00001000;
    }
}

/// The type of QP used for communciation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpType {
    /// reliable connection
    RC,
    /// unreliable datagram
    UD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
    /// Send queue error, the receive queue keeps working.
    Sqe,
    Error,
}

/// Destination of an RC connection or of a UD address handle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressVector {
    pub dgid: Gid,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub port_num: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub cur_qp_state: QpState,
    pub path_mtu: Mtu,
    pub qkey: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub qp_access_flags: AccessFlags,
    pub ah_attr: AddressVector,
    pub pkey_index: u16,
    pub port_num: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpInitAttr {
    pub send_cq: CompletionQueue,
    pub recv_cq: CompletionQueue,
    pub cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}

/// Scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    Send,
    SendWithImm,
    RdmaWrite,
    RdmaWriteWithImm,
    RdmaRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKey {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdDest {
    pub remote_qpn: u32,
    pub remote_qkey: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub send_flags: SendFlags,
    pub sg_list: Vec<Sge>,
    pub imm_data: Option<u32>,
    /// Target of RDMA read/write.
    pub remote: Option<RemoteKey>,
    /// Destination of a UD send.
    pub ud: Option<UdDest>,
}

impl SendWr {
    pub fn send(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        SendWr {
            wr_id,
            opcode: WrOpcode::Send,
            send_flags: SendFlags::SIGNALED,
            sg_list,
            imm_data: None,
            remote: None,
            ud: None,
        }
    }

    /// Total number of bytes described by the gather list.
    pub fn total_len(&self) -> u64 {
        self.sg_list.iter().map(|s| s.length as u64).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

impl RecvWr {
    pub fn new(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        RecvWr { wr_id, sg_list }
    }

    pub fn total_len(&self) -> u64 {
        self.sg_list.iter().map(|s| s.length as u64).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalQpOperationError,
    LocalProtectionError,
    /// The work request was outstanding when its QP entered an error state.
    WrFlushError,
    RemoteInvalidRequest,
    RemoteAccessError,
    RetryExceeded,
    RnrRetryExceeded,
    GeneralError,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
}

impl From<WrOpcode> for WcOpcode {
    fn from(op: WrOpcode) -> Self {
        match op {
            WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        }
    }
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub qp_num: u32,
    pub src_qp: u32,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub wc_flags: WcFlags,
}
