//! Client side of the duplex correlation layer
//!
//! [`ClientHub::execute`] registers a [`PendingRequest`] under a fresh `reqId`
//! before any byte is written, then awaits it. The transport's receive loop
//! calls [`ClientHub::on_receive`], which removes the matching entry and
//! resolves it. Closing the hub cancels every pending entry.

mod pending;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use pending::PendingRequest;

use crate::error::{HubError, HubResult};
use crate::event::ClientEvents;
use crate::protocol::{decode_message, encode_message, ProtocolMessage, SyncRequest, SyncResponse};
use crate::transport::Outbound;
use crate::types::SyncTask;

/// Who the client is. `client_id` is filled in by the hub on first contact
/// when left empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientIdentity {
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Client endpoint of one connection
pub struct ClientHub {
    outbound: Arc<dyn Outbound>,
    identity: Mutex<ClientIdentity>,
    events: Arc<ClientEvents>,
    next_req_id: AtomicI64,
    pending: DashMap<i64, PendingRequest>,
    cancel: CancellationToken,
}

impl ClientHub {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        identity: ClientIdentity,
        events: Arc<ClientEvents>,
    ) -> Self {
        Self::with_cancellation(outbound, identity, events, CancellationToken::new())
    }

    /// Build on an existing token, so the transport's loops stop with the hub
    pub fn with_cancellation(
        outbound: Arc<dyn Outbound>,
        identity: ClientIdentity,
        events: Arc<ClientEvents>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            identity: Mutex::new(identity),
            events,
            next_req_id: AtomicI64::new(1),
            pending: DashMap::new(),
            cancel,
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity.lock().clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity.lock().client_id.clone()
    }

    pub fn events(&self) -> &Arc<ClientEvents> {
        &self.events
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a batch and wait for its correlated response.
    ///
    /// Request-level failures come back as [`HubError::Remote`]; task-level
    /// failures are inside the returned results.
    pub async fn execute(&self, tasks: Vec<SyncTask>) -> HubResult<SyncResponse> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel.child_token();
        let (entry, receiver) = PendingRequest::new(req_id, token.clone());
        self.pending.insert(req_id, entry);
        let _guard = PendingGuard {
            pending: &self.pending,
            req_id,
        };

        // close() may have drained the map just before the insert
        if self.cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        let request = {
            let identity = self.identity.lock();
            let last_seq = self.events.last_seq();
            ProtocolMessage::Request(SyncRequest {
                req_id: Some(req_id),
                user_id: identity.user_id.clone(),
                token: identity.token.clone(),
                client_id: identity.client_id.clone(),
                event_ack: (last_seq > 0).then_some(last_seq),
                tasks,
            })
        };
        encode_message(&request).and_then(|bytes| self.outbound.send(bytes))?;

        tokio::select! {
            result = receiver => result.unwrap_or(Err(HubError::Cancelled)),
            _ = token.cancelled() => Err(HubError::Cancelled),
        }
    }

    /// Handle one raw message from the hub
    pub fn on_receive(&self, raw: &[u8]) {
        match decode_message(raw) {
            Ok(ProtocolMessage::Response(response)) => {
                if let Some(client_id) = response.client_id.as_deref() {
                    self.adopt_client_id(client_id);
                }
                self.resolve(response.req_id, Ok(response));
            }
            Ok(ProtocolMessage::Error(error)) => {
                let err = HubError::Remote {
                    kind: error.error.kind,
                    message: error.error.message,
                };
                if error.req_id.is_none() {
                    warn!("hub reported an uncorrelated error: {}", err);
                    return;
                }
                self.resolve(error.req_id, Err(err));
            }
            Ok(ProtocolMessage::Event(event)) => self.events.on_event(event),
            Ok(ProtocolMessage::Request(request)) => {
                warn!(req_id = ?request.req_id, "unexpected request from hub");
            }
            Err(e) => warn!("failed to parse message from hub: {}", e),
        }
    }

    fn adopt_client_id(&self, client_id: &str) {
        let mut identity = self.identity.lock();
        if identity.client_id.is_none() {
            debug!(client_id, "client id assigned by hub");
            identity.client_id = Some(client_id.to_string());
        }
    }

    fn resolve(&self, req_id: Option<i64>, result: HubResult<SyncResponse>) {
        let Some(req_id) = req_id else {
            warn!("response without reqId dropped");
            return;
        };
        match self.pending.remove(&req_id) {
            Some((_, entry)) => entry.resolve(result),
            None => warn!(req_id, "no pending request for response"),
        }
    }

    /// Cancel every pending request and stop the transport. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.cancel();
            }
        }
    }
}

/// Removes a pending entry when `execute` returns or its future is dropped
struct PendingGuard<'a> {
    pending: &'a DashMap<i64, PendingRequest>,
    req_id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.req_id);
    }
}

impl Drop for ClientHub {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::event::EventDelivery;
    use crate::protocol::{ErrorKind, ErrorResponse};
    use crate::transport::testing::RecordingOutbound;
    use crate::types::{EventMessage, EventPayload, TaskResult};

    fn setup() -> (Arc<ClientHub>, Arc<RecordingOutbound>) {
        let outbound = Arc::new(RecordingOutbound::new());
        let hub = Arc::new(ClientHub::new(
            outbound.clone(),
            ClientIdentity::new("alice"),
            Arc::new(ClientEvents::new(EventDelivery::Immediate)),
        ));
        (hub, outbound)
    }

    async fn next_request(outbound: &RecordingOutbound) -> SyncRequest {
        for _ in 0..100 {
            if let Some(raw) = outbound.take().first() {
                match decode_message(raw).unwrap() {
                    ProtocolMessage::Request(r) => return r,
                    other => panic!("unexpected {other:?}"),
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no request sent");
    }

    fn encode(message: ProtocolMessage) -> Vec<u8> {
        serde_json::to_vec(&message).unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let (hub, outbound) = setup();
        let call = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.execute(vec![SyncTask::new("read", json!({}))]).await }
        });

        let request = next_request(&outbound).await;
        assert_eq!(request.user_id.as_deref(), Some("alice"));
        assert_eq!(hub.pending_count(), 1);

        hub.on_receive(&encode(ProtocolMessage::Response(SyncResponse {
            req_id: request.req_id,
            client_id: Some("c42".to_string()),
            results: vec![TaskResult::ok()],
            auth_error: None,
        })));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.results, vec![TaskResult::ok()]);
        assert_eq!(hub.client_id().as_deref(), Some("c42"));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_is_remote_error() {
        let (hub, outbound) = setup();
        let call = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.execute(vec![]).await }
        });

        let request = next_request(&outbound).await;
        hub.on_receive(&encode(ProtocolMessage::Error(ErrorResponse::bad_request(
            request.req_id,
            "nope".to_string(),
        ))));

        match call.await.unwrap() {
            Err(HubError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::BadRequest),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unmatched_response_is_ignored() {
        let (hub, _outbound) = setup();
        hub.on_receive(&encode(ProtocolMessage::Response(SyncResponse {
            req_id: Some(999),
            ..Default::default()
        })));
        hub.on_receive(b"not json");
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_pending() {
        let (hub, outbound) = setup();
        let call = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.execute(vec![]).await }
        });
        next_request(&outbound).await;

        hub.close();
        assert!(matches!(call.await.unwrap(), Err(HubError::Cancelled)));
        assert_eq!(hub.pending_count(), 0);

        // closed hub refuses new work
        assert!(matches!(hub.execute(vec![]).await, Err(HubError::Cancelled)));
    }

    #[tokio::test]
    async fn test_send_failure_unregisters_request() {
        let (hub, outbound) = setup();
        outbound.close();
        assert!(matches!(
            hub.execute(vec![]).await,
            Err(HubError::ConnectionClosed)
        ));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_unregistered() {
        let (hub, outbound) = setup();
        let result = tokio::time::timeout(Duration::from_millis(20), hub.execute(vec![])).await;
        assert!(result.is_err());
        assert_eq!(outbound.take().len(), 1);
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_event_ack_follows_applied_events() {
        let (hub, outbound) = setup();
        hub.on_receive(&encode(ProtocolMessage::Event(EventMessage {
            client_id: "c1".to_string(),
            seq: 1,
            src_user_id: None,
            payload: vec![EventPayload::Message {
                name: "hello".to_string(),
                param: json!(null),
            }],
            timestamp: 0,
        })));

        let call = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.execute(vec![]).await }
        });
        let request = next_request(&outbound).await;
        assert_eq!(request.event_ack, Some(1));
        hub.close();
        let _ = call.await;
    }
}
