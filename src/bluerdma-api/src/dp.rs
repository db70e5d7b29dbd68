//! Data path operations.
use serde::{Deserialize, Serialize};

use crate::net::{CompletionQueue, QueuePair, RecvWr, SendWr, WorkCompletion};

type IResult<T> = Result<T, crate::Error>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkRequest {
    PostSend(QueuePair, SendWr),
    PostRecv(QueuePair, RecvWr),
    /// Poll at most the given number of completions.
    PollCq(CompletionQueue, u32),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CompletionKind {
    PostSend,
    PostRecv,
    PollCq(Vec<WorkCompletion>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Completion(pub IResult<CompletionKind>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Sge, WcFlags, WcOpcode, WcStatus};
    use crate::Handle;

    #[test]
    fn work_request_survives_bincode() {
        let wr = WorkRequest::PostSend(
            QueuePair(Handle::compose(1, 5)),
            SendWr::send(9, vec![Sge { addr: 0x1000, length: 64, lkey: 0x1001 }]),
        );
        let buf = bincode::serialize(&wr).unwrap();
        match bincode::deserialize::<WorkRequest>(&buf).unwrap() {
            WorkRequest::PostSend(qp, send) => {
                assert_eq!(qp.0, Handle::compose(1, 5));
                assert_eq!(send.wr_id, 9);
                assert_eq!(send.total_len(), 64);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn completion_carries_errors() {
        let c = Completion(Err(crate::Error::Busy("cq".into())));
        let buf = bincode::serialize(&c).unwrap();
        let back: Completion = bincode::deserialize(&buf).unwrap();
        assert!(matches!(back.0, Err(crate::Error::Busy(_))));

        let wc = WorkCompletion {
            wr_id: 1,
            status: WcStatus::WrFlushError,
            opcode: WcOpcode::Recv,
            qp_num: 0x4001,
            src_qp: 0,
            vendor_err: 0,
            byte_len: 0,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        };
        let c = Completion(Ok(CompletionKind::PollCq(vec![wc.clone()])));
        let back: Completion = bincode::deserialize(&bincode::serialize(&c).unwrap()).unwrap();
        match back.0 {
            Ok(CompletionKind::PollCq(wcs)) => assert_eq!(wcs, vec![wc]),
            other => panic!("unexpected completion: {:?}", other),
        }
    }
}
