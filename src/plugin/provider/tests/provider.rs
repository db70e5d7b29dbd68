use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::unistd::Pid;

use bluerdma::api::cmd::{Command, Completion, CompletionKind};
use bluerdma::api::dp::{self, WorkRequest};
use bluerdma::api::net::{
    self, AccessFlags, Mtu, QpAttr, QpAttrMask, QpCapability, QpInitAttr, QpState, QpType,
    RecvWr, SendWr, Sge, WcStatus,
};
use bluerdma::api::wire::{Reply, Request};
use bluerdma::api::Error;
use bluerdma::backend::loopback::LoopbackFactory;
use bluerdma::backend::{Backend, BackendFactory, DeviceInfo};
use bluerdma_provider::{init_module, ApiError, Ops, Provider, ProviderConfig};

const CONFIG: &str = r#"
log_level = "debug"

[[devices]]
netdev = "blue0"

[[devices]]
netdev = "blue1"
link_up = false
"#;

fn provider() -> Provider {
    init_module(Some(CONFIG)).unwrap()
}

fn expect(c: Completion) -> CompletionKind {
    c.0.unwrap()
}

fn open_first(ops: &Ops) -> net::Context {
    let devices = ops.get_device_list();
    ops.open_device(&devices[0].handle).unwrap().handle
}

struct Setup {
    ctx: net::Context,
    pd: net::ProtectionDomain,
    cq: net::CompletionQueue,
    lkey: u32,
}

fn setup(ops: &Ops) -> Setup {
    let ctx = open_first(ops);
    let pd = ops.alloc_pd(&ctx).unwrap().handle;
    let cq = ops.create_cq(&ctx, 64).unwrap().handle;
    let mr = ops.reg_mr(&pd, 0x1000, 0x1000, AccessFlags::all()).unwrap();
    Setup {
        ctx,
        pd,
        cq,
        lkey: mr.lkey,
    }
}

fn connected_qp(ops: &Ops, s: &Setup) -> net::QueuePair {
    let init_attr = QpInitAttr {
        send_cq: s.cq,
        recv_cq: s.cq,
        cap: QpCapability {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        },
        qp_type: QpType::RC,
        sq_sig_all: true,
    };
    let qp = ops.create_qp(&s.pd, &init_attr).unwrap();
    let steps = [
        (
            QpAttr {
                qp_state: QpState::Init,
                port_num: 1,
                qp_access_flags: AccessFlags::all(),
                ..Default::default()
            },
            QpAttrMask::STATE | QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS,
        ),
        (
            QpAttr {
                qp_state: QpState::Rtr,
                path_mtu: Mtu::Mtu1024,
                dest_qp_num: qp.qp_num,
                max_dest_rd_atomic: 1,
                ..Default::default()
            },
            QpAttrMask::STATE
                | QpAttrMask::AV
                | QpAttrMask::PATH_MTU
                | QpAttrMask::DEST_QPN
                | QpAttrMask::RQ_PSN
                | QpAttrMask::MAX_DEST_RD_ATOMIC,
        ),
        (
            QpAttr {
                qp_state: QpState::Rts,
                timeout: 14,
                retry_cnt: 7,
                rnr_retry: 7,
                max_rd_atomic: 1,
                ..Default::default()
            },
            QpAttrMask::STATE
                | QpAttrMask::SQ_PSN
                | QpAttrMask::TIMEOUT
                | QpAttrMask::RETRY_CNT
                | QpAttrMask::RNR_RETRY
                | QpAttrMask::MAX_QP_RD_ATOMIC,
        ),
    ];
    for (attr, mask) in &steps {
        ops.modify_qp(&qp.handle, attr, *mask).unwrap();
    }
    qp.handle
}

#[test]
fn configured_devices_are_attached() {
    let provider = provider();
    assert_eq!(provider.registry().len(), 2);
    let ops = provider.ops(Pid::from_raw(100));
    let devices = ops.get_device_list();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name, "bluerdma0");
    assert_eq!(devices[0].port_state, net::PortState::Active);
    assert_eq!(devices[1].port_state, net::PortState::Down);
    assert_eq!(devices[1].hw_addr.to_string(), "02:bd:bd:00:00:02");
}

#[test]
fn loopback_through_ops() {
    let provider = provider();
    let ops = provider.ops(Pid::from_raw(101));
    let s = setup(&ops);
    let qp = connected_qp(&ops, &s);

    let sge = Sge {
        addr: 0x1000,
        length: 32,
        lkey: s.lkey,
    };
    ops.post_recv(&qp, &RecvWr::new(1, vec![sge])).unwrap();
    ops.post_send(&qp, &SendWr::send(2, vec![sge])).unwrap();

    let mut wc = Vec::new();
    assert_eq!(ops.poll_cq(&s.cq, 16, &mut wc).unwrap(), 2);
    assert!(wc.iter().all(|c| c.status == WcStatus::Success));

    let (attr, init_attr) = ops.query_qp(&qp).unwrap();
    assert_eq!(attr.qp_state, QpState::Rts);
    assert!(init_attr.sq_sig_all);
}

#[test]
fn handles_do_not_cross_processes() {
    let provider = provider();
    let alice = provider.ops(Pid::from_raw(200));
    let mallory = provider.ops(Pid::from_raw(201));
    let s = setup(&alice);

    assert!(matches!(
        mallory.alloc_pd(&s.ctx),
        Err(ApiError::NotOwned(_))
    ));
    assert!(matches!(
        mallory.dealloc_pd(&s.pd),
        Err(ApiError::NotOwned(_))
    ));
    let mut wc = Vec::new();
    assert!(matches!(
        mallory.poll_cq(&s.cq, 4, &mut wc),
        Err(ApiError::NotOwned(_))
    ));

    let c = mallory.dispatch(&Command::DestroyCq(s.cq));
    assert!(matches!(c.0, Err(Error::NotFound(_))));
    // still alive for its owner
    alice.req_notify_cq(&s.cq, false).unwrap();
}

#[test]
fn dispatch_follows_the_lifecycle() {
    let provider = provider();
    let ops = provider.ops(Pid::from_raw(300));

    let devices = match expect(ops.dispatch(&Command::GetDeviceList)) {
        CompletionKind::GetDeviceList(d) => d,
        other => panic!("unexpected completion: {:?}", other),
    };
    let ctx = match expect(ops.dispatch(&Command::OpenDevice(devices[0].handle))) {
        CompletionKind::OpenDevice(ctx) => ctx.handle,
        other => panic!("unexpected completion: {:?}", other),
    };
    let pd = match expect(ops.dispatch(&Command::AllocPd(ctx))) {
        CompletionKind::AllocPd(pd) => pd.handle,
        other => panic!("unexpected completion: {:?}", other),
    };
    match expect(ops.dispatch(&Command::QueryPkey(ctx, 1, 0))) {
        CompletionKind::QueryPkey(pkey) => assert_eq!(pkey, 1),
        other => panic!("unexpected completion: {:?}", other),
    }

    let busy = ops.dispatch(&Command::CloseDevice(ctx));
    match busy.0 {
        Err(e) => assert_eq!(e.to_errno(), nix::errno::Errno::EBUSY as i32),
        Ok(kind) => panic!("close succeeded: {:?}", kind),
    }

    assert!(matches!(
        expect(ops.dispatch(&Command::DeallocPd(pd))),
        CompletionKind::DeallocPd
    ));
    assert!(matches!(
        expect(ops.dispatch(&Command::CloseDevice(ctx))),
        CompletionKind::CloseDevice
    ));
    assert!(matches!(
        ops.dispatch(&Command::QueryDevice(ctx)).0,
        Err(Error::NotFound(_))
    ));
}

#[test]
fn encoded_requests_round_trip() {
    let provider = provider();
    let ops = provider.ops(Pid::from_raw(400));
    let s = setup(&ops);
    let qp = connected_qp(&ops, &s);
    let sge = Sge {
        addr: 0x1000,
        length: 8,
        lkey: s.lkey,
    };

    let reqs = [
        Request::Dp(WorkRequest::PostRecv(qp, RecvWr::new(1, vec![sge]))),
        Request::Dp(WorkRequest::PostSend(qp, SendWr::send(2, vec![sge]))),
    ];
    for req in &reqs {
        let buf = bincode::serialize(req).unwrap();
        let reply: Reply = bincode::deserialize(&ops.handle_encoded(&buf).unwrap()).unwrap();
        assert!(matches!(reply, Reply::Dp(dp::Completion(Ok(_)))));
    }

    let buf = bincode::serialize(&Request::Dp(WorkRequest::PollCq(s.cq, 1))).unwrap();
    let reply: Reply = bincode::deserialize(&ops.handle_encoded(&buf).unwrap()).unwrap();
    match reply {
        Reply::Dp(dp::Completion(Ok(dp::CompletionKind::PollCq(wc)))) => {
            assert_eq!(wc.len(), 1);
            assert_eq!(wc[0].wr_id, 1);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    let buf = bincode::serialize(&Request::Cmd(Command::QueryPort(s.ctx, 9))).unwrap();
    let reply: Reply = bincode::deserialize(&ops.handle_encoded(&buf).unwrap()).unwrap();
    assert!(matches!(
        reply,
        Reply::Cmd(Completion(Err(Error::InvalidArgument(_))))
    ));

    assert!(matches!(
        ops.handle_encoded(&[0xff, 0xff, 0xff, 0xff, 0xff]),
        Err(ApiError::Codec(_))
    ));
}

#[test]
fn departed_process_is_cleaned_up() {
    let provider = provider();
    let pid = Pid::from_raw(500);
    let device = provider.registry().devices()[0].clone();
    {
        let ops = provider.ops(pid);
        let twin = ops.clone();
        let s = setup(&ops);
        connected_qp(&twin, &s);
        assert!(provider.has_client(pid));
        assert_eq!(device.contexts(), 1);
        assert_eq!(device.mr_count(), 1);
    }
    assert!(!provider.has_client(pid));
    assert_eq!(device.contexts(), 0);
    assert_eq!(device.mr_count(), 0);
    provider.detach(device.handle()).unwrap();
    assert_eq!(provider.registry().len(), 1);
}

#[derive(Debug, Default)]
struct Counting {
    created: AtomicUsize,
}

impl BackendFactory for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn create(&self, device: &DeviceInfo) -> bluerdma::Result<Arc<dyn Backend>> {
        self.created.fetch_add(1, Ordering::AcqRel);
        LoopbackFactory.create(device)
    }
}

#[test]
fn backends_are_registered_by_name() {
    let provider = Provider::new(ProviderConfig::default()).unwrap();
    let netdev = Arc::new(bluerdma::netdev::SoftNetDevice::for_index(3));
    assert!(matches!(
        provider.attach(Arc::clone(&netdev) as _, "counting"),
        Err(ApiError::BackendNotFound(_))
    ));

    let factory = Arc::new(Counting::default());
    provider.register_backend(Arc::clone(&factory) as _).unwrap();
    assert!(matches!(
        provider.register_backend(Arc::clone(&factory) as _),
        Err(ApiError::BackendExists(_))
    ));
    let device = provider.attach(netdev, "counting").unwrap();

    crossbeam::thread::scope(|s| {
        for i in 0..4 {
            let provider = &provider;
            let handle = net::Device(device.handle());
            s.spawn(move |_| {
                let ops = provider.ops(Pid::from_raw(600 + i));
                let ctx = ops.open_device(&handle).unwrap().handle;
                ops.close_device(&ctx).unwrap();
            });
        }
    })
    .unwrap();
    assert_eq!(factory.created.load(Ordering::Acquire), 1);
    provider.detach(device.handle()).unwrap();
}
