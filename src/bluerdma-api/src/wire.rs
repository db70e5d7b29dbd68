//! Envelopes for requests that cross the process boundary as one encoded buffer.
use serde::{Deserialize, Serialize};

use crate::{cmd, dp};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Cmd(cmd::Command),
    Dp(dp::WorkRequest),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Reply {
    Cmd(cmd::Completion),
    Dp(dp::Completion),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{CompletionQueue, Context};
    use crate::Handle;

    #[test]
    fn envelopes_keep_their_side() {
        let reqs = [
            Request::Cmd(cmd::Command::AllocPd(Context(Handle::compose(3, 0)))),
            Request::Dp(dp::WorkRequest::PollCq(
                CompletionQueue(Handle::compose(3, 2)),
                16,
            )),
        ];
        for req in reqs {
            let buf = bincode::serialize(&req).unwrap();
            let back: Request = bincode::deserialize(&buf).unwrap();
            match (req, back) {
                (Request::Cmd(cmd::Command::AllocPd(a)), Request::Cmd(cmd::Command::AllocPd(b))) => {
                    assert_eq!(a.0, b.0)
                }
                (
                    Request::Dp(dp::WorkRequest::PollCq(a, n)),
                    Request::Dp(dp::WorkRequest::PollCq(b, m)),
                ) => {
                    assert_eq!(a.0, b.0);
                    assert_eq!(n, m);
                }
                (req, back) => panic!("{:?} decoded as {:?}", req, back),
            }
        }
    }
}
