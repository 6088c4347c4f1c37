//! Requests awaiting their response

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::HubResult;
use crate::protocol::SyncResponse;

/// One in-flight request, owned by the pending map until resolved
#[derive(Debug)]
pub struct PendingRequest {
    req_id: i64,
    sender: oneshot::Sender<HubResult<SyncResponse>>,
    cancel: CancellationToken,
}

impl PendingRequest {
    /// Create the entry and the receiver its caller awaits
    pub fn new(
        req_id: i64,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<HubResult<SyncResponse>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                req_id,
                sender,
                cancel,
            },
            receiver,
        )
    }

    pub fn req_id(&self) -> i64 {
        self.req_id
    }

    /// Deliver the outcome. A caller that stopped waiting is ignored.
    pub fn resolve(self, result: HubResult<SyncResponse>) {
        let _ = self.sender.send(result);
    }

    /// Wake the caller with a cancellation
    pub fn cancel(self) {
        self.cancel.cancel();
    }
}
