#![allow(dead_code)]
use std::sync::{Arc, Mutex};

use bluerdma::api::net::{
    AccessFlags, CompletionQueue as CqHandle, Mtu, QpAttr, QpAttrMask, QpCapability, QpInitAttr,
    QpState, QpType, Sge,
};
use bluerdma::backend::loopback::LoopbackFactory;
use bluerdma::backend::BackendFactory;
use bluerdma::config::DeviceConfig;
use bluerdma::mr::MemoryRegion;
use bluerdma::netdev::SoftNetDevice;
use bluerdma::qp::QueuePair;
use bluerdma::verbs::{CqVerbs, MrVerbs, PdVerbs, QpVerbs};
use bluerdma::{Context, Device, DeviceRegistry, Handle};

pub const REGION_ADDR: u64 = 0x10_0000;
pub const REGION_LEN: u64 = 1 << 16;

pub fn registry_with(factory: Arc<dyn BackendFactory>) -> (DeviceRegistry, Arc<SoftNetDevice>, Arc<Device>) {
    let registry = DeviceRegistry::new(DeviceConfig::default()).unwrap();
    let netdev = Arc::new(SoftNetDevice::for_index(0));
    let device = registry.attach(Arc::clone(&netdev) as _, factory).unwrap();
    (registry, netdev, device)
}

pub fn loopback() -> (DeviceRegistry, Arc<SoftNetDevice>, Arc<Device>) {
    registry_with(Arc::new(LoopbackFactory))
}

/// A context with one PD, one CQ and one MR covering the test region.
pub struct Fixture {
    pub ctx: Arc<Context>,
    pub pd: Handle,
    pub cq: Handle,
    pub mr: Arc<MemoryRegion>,
    qps: Mutex<Vec<Handle>>,
}

impl Fixture {
    pub fn new(device: &Arc<Device>, cq_capacity: u32) -> Self {
        let ctx = device.open().unwrap();
        let pd = ctx.alloc_pd().unwrap().handle();
        let cq = ctx.create_cq(cq_capacity).unwrap().handle();
        let mr = ctx
            .reg_mr(pd, REGION_ADDR, REGION_LEN, AccessFlags::all())
            .unwrap();
        Fixture {
            ctx,
            pd,
            cq,
            mr,
            qps: Mutex::new(Vec::new()),
        }
    }

    pub fn sge(&self, offset: u64, length: u32) -> Sge {
        Sge {
            addr: REGION_ADDR + offset,
            length,
            lkey: self.mr.lkey(),
        }
    }

    pub fn create_qp(&self, qp_type: QpType) -> Arc<QueuePair> {
        let init_attr = QpInitAttr {
            send_cq: CqHandle(self.cq),
            recv_cq: CqHandle(self.cq),
            cap: QpCapability {
                max_send_wr: 32,
                max_recv_wr: 32,
                max_send_sge: 4,
                max_recv_sge: 4,
                max_inline_data: 64,
            },
            qp_type,
            sq_sig_all: false,
        };
        let qp = self.ctx.create_qp(self.pd, &init_attr).unwrap();
        self.qps.lock().unwrap().push(qp.handle());
        qp
    }

    pub fn to_init(&self, qp: &QueuePair) {
        let (attr, mask) = init_attr(qp.qp_type());
        self.ctx.modify_qp(qp.handle(), &attr, mask).unwrap();
    }

    pub fn to_rtr(&self, qp: &QueuePair, dest_qpn: u32) {
        let (attr, mask) = rtr_attr(qp.qp_type(), dest_qpn);
        self.ctx.modify_qp(qp.handle(), &attr, mask).unwrap();
    }

    pub fn to_rts(&self, qp: &QueuePair) {
        let (attr, mask) = rts_attr(qp.qp_type());
        self.ctx.modify_qp(qp.handle(), &attr, mask).unwrap();
    }

    /// Brings `qp` to RTS, connected to `dest_qpn` when it is an RC QP.
    pub fn connect(&self, qp: &QueuePair, dest_qpn: u32) {
        self.to_init(qp);
        self.to_rtr(qp, dest_qpn);
        self.to_rts(qp);
    }

    pub fn teardown(self) {
        for qp in self.qps.lock().unwrap().drain(..) {
            self.ctx.destroy_qp(qp).unwrap();
        }
        self.ctx.dereg_mr(self.mr.handle()).unwrap();
        self.ctx.destroy_cq(self.cq).unwrap();
        self.ctx.dealloc_pd(self.pd).unwrap();
        self.ctx.close().unwrap();
    }

}

pub fn init_attr(qp_type: QpType) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Init,
        port_num: 1,
        pkey_index: 0,
        qp_access_flags: AccessFlags::all(),
        qkey: 0x1111_1111,
        ..Default::default()
    };
    let mask = match qp_type {
        QpType::RC => QpAttrMask::STATE | QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS,
        QpType::UD => {
            QpAttrMask::STATE | QpAttrMask::PORT | QpAttrMask::PKEY_INDEX | QpAttrMask::QKEY
        }
    };
    (attr, mask)
}

pub fn rtr_attr(qp_type: QpType, dest_qpn: u32) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Rtr,
        path_mtu: Mtu::Mtu1024,
        dest_qp_num: dest_qpn,
        rq_psn: 0,
        max_dest_rd_atomic: 1,
        ..Default::default()
    };
    let mask = match qp_type {
        QpType::RC => {
            QpAttrMask::STATE
                | QpAttrMask::AV
                | QpAttrMask::PATH_MTU
                | QpAttrMask::DEST_QPN
                | QpAttrMask::RQ_PSN
                | QpAttrMask::MAX_DEST_RD_ATOMIC
        }
        QpType::UD => QpAttrMask::STATE,
    };
    (attr, mask)
}

pub fn rts_attr(qp_type: QpType) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Rts,
        sq_psn: 0,
        timeout: 14,
        retry_cnt: 7,
        rnr_retry: 7,
        max_rd_atomic: 1,
        ..Default::default()
    };
    let mask = match qp_type {
        QpType::RC => {
            QpAttrMask::STATE
                | QpAttrMask::SQ_PSN
                | QpAttrMask::TIMEOUT
                | QpAttrMask::RETRY_CNT
                | QpAttrMask::RNR_RETRY
                | QpAttrMask::MAX_QP_RD_ATOMIC
        }
        QpType::UD => QpAttrMask::STATE | QpAttrMask::SQ_PSN,
    };
    (attr, mask)
}

pub fn error_attr() -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Error,
        ..Default::default()
    };
    (attr, QpAttrMask::STATE)
}
