//! Server-side event dispatcher
//!
//! Keeps one [`ClientEventQueue`] and one [`Subscription`] per logical client
//! (keyed by `clientId`, not by connection). Mutation brokers call
//! [`EventDispatcher::publish`] or [`EventDispatcher::send_event`]; hosts call
//! [`EventDispatcher::on_client_request`] for every incoming request so that
//! acknowledged events are dropped and the rest are resent over the current
//! connection.

use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::queue::ClientEventQueue;
use crate::error::HubResult;
use crate::transport::Outbound;
use crate::types::{ChangeKind, EventPayload, Subscription};

struct EventClient {
    queue: ClientEventQueue,
    subscription: Subscription,
    remote: Option<Arc<dyn Outbound>>,
}

impl EventClient {
    fn new(queue: ClientEventQueue) -> Self {
        Self {
            queue,
            subscription: Subscription::new(),
            remote: None,
        }
    }

    /// Enqueue and push immediately when the client is connected
    fn push(&mut self, src_user_id: Option<&str>, payload: Vec<EventPayload>) -> HubResult<i64> {
        let event = self.queue.enqueue(src_user_id, payload)?;
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.send(event.encoded) {
                debug!(
                    client_id = self.queue.client_id(),
                    seq = event.seq,
                    "push failed, event retained: {}",
                    e
                );
                self.remote = None;
            }
        }
        Ok(event.seq)
    }

    fn is_disposable(&self) -> bool {
        self.remote.is_none() && self.subscription.is_empty() && self.queue.is_empty()
    }
}

/// Counters exposed by [`EventDispatcher::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub clients: usize,
    pub connected: usize,
    pub retained_events: usize,
}

/// Routes mutation events to subscribed clients
#[derive(Default)]
pub struct EventDispatcher {
    clients: DashMap<String, EventClient>,
    /// Last seq of disposed clients, so a returning client never sees a
    /// seq it already applied
    retired: DashMap<String, i64>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, client_id: &str) -> RefMut<'_, String, EventClient> {
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| {
                let queue = match self.retired.remove(client_id) {
                    Some((_, last_seq)) => {
                        debug!(client_id, last_seq, "event client resumed");
                        ClientEventQueue::resume(client_id, last_seq)
                    }
                    None => ClientEventQueue::new(client_id),
                };
                EventClient::new(queue)
            })
    }

    /// Watch `kinds` of changes on `container`. An empty slice unsubscribes.
    pub fn subscribe_changes(&self, client_id: &str, container: &str, kinds: &[ChangeKind]) {
        let mut client = self.client(client_id);
        client.subscription.set_changes(container, kinds);
        debug!(client_id, container, ?kinds, "change subscription updated");
    }

    pub fn subscribe_message(&self, client_id: &str, name: &str, enabled: bool) {
        let mut client = self.client(client_id);
        if enabled {
            client.subscription.add_message(name);
        } else {
            client.subscription.remove_message(name);
        }
        debug!(client_id, name, enabled, "message subscription updated");
    }

    /// Enqueue the matching part of `payloads` for every subscriber.
    /// Returns the number of clients that received an event.
    pub fn publish(&self, src_user_id: Option<&str>, payloads: &[EventPayload]) -> usize {
        if payloads.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for mut client in self.clients.iter_mut() {
            let matching: Vec<EventPayload> = payloads
                .iter()
                .filter(|p| client.subscription.matches(p))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            match client.push(src_user_id, matching) {
                Ok(_) => delivered += 1,
                Err(e) => warn!(client_id = client.key().as_str(), "failed to enqueue event: {}", e),
            }
        }
        delivered
    }

    /// Enqueue an event for one client regardless of its subscription.
    /// Returns the assigned seq.
    pub fn send_event(
        &self,
        client_id: &str,
        src_user_id: Option<&str>,
        payload: Vec<EventPayload>,
    ) -> HubResult<i64> {
        let mut client = self.client(client_id);
        client.push(src_user_id, payload)
    }

    /// Apply a request's `eventAck`, bind the client to `remote` and resend
    /// every retained event in seq order
    pub fn on_client_request(
        &self,
        client_id: &str,
        event_ack: Option<i64>,
        remote: &Arc<dyn Outbound>,
    ) {
        let mut client = self.client(client_id);

        if let Some(ack) = event_ack {
            let removed = client.queue.acknowledge(ack);
            if removed > 0 {
                debug!(client_id, ack, removed, "events acknowledged");
            }
        }

        let rebound = client
            .remote
            .as_ref()
            .map_or(true, |r| r.connection_id() != remote.connection_id());
        if rebound {
            info!(
                client_id,
                connection_id = remote.connection_id(),
                "event client attached"
            );
            client.remote = Some(Arc::clone(remote));
        }

        let mut resent = 0;
        for event in client.queue.retained() {
            if let Err(e) = remote.send(event.encoded.clone()) {
                debug!(client_id, seq = event.seq, "resend stopped: {}", e);
                break;
            }
            resent += 1;
        }
        if resent > 0 {
            debug!(client_id, resent, "retained events resent");
        }
    }

    /// Unbind a client from a closing connection.
    ///
    /// The record is dropped when nothing else keeps it alive.
    pub fn detach(&self, client_id: &str, connection_id: u64) {
        if let Some(mut client) = self.clients.get_mut(client_id) {
            if client
                .remote
                .as_ref()
                .is_some_and(|r| r.connection_id() == connection_id)
            {
                client.remote = None;
                debug!(client_id, connection_id, "event client detached");
            }
        }
        // retire under the shard lock so a concurrent request for the same
        // client cannot recreate it before its last seq is recorded
        self.clients.remove_if(client_id, |id, c| {
            if !c.is_disposable() {
                return false;
            }
            if c.queue.last_seq() > 0 {
                self.retired.insert(id.clone(), c.queue.last_seq());
            }
            true
        });
    }

    /// Number of events retained for `client_id`
    pub fn retained(&self, client_id: &str) -> usize {
        self.clients.get(client_id).map_or(0, |c| c.queue.len())
    }

    pub fn stats(&self) -> DispatcherStats {
        let mut stats = DispatcherStats::default();
        for client in self.clients.iter() {
            stats.clients += 1;
            stats.retained_events += client.queue.len();
            if client.remote.is_some() {
                stats.connected += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::{decode_message, ProtocolMessage};
    use crate::transport::testing::RecordingOutbound;
    use crate::types::EventMessage;

    fn events(outbound: &RecordingOutbound) -> Vec<EventMessage> {
        outbound
            .take()
            .iter()
            .map(|raw| match decode_message(raw).unwrap() {
                ProtocolMessage::Event(ev) => ev,
                other => panic!("unexpected message {other:?}"),
            })
            .collect()
    }

    fn upsert(container: &str, id: &str) -> EventPayload {
        EventPayload::Upsert {
            container: container.to_string(),
            entities: vec![json!({ "id": id })],
        }
    }

    #[test]
    fn test_publish_filters_by_subscription() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe_changes("c1", "articles", &[ChangeKind::Upsert]);
        dispatcher.subscribe_changes("c2", "authors", &ChangeKind::ALL);

        let delivered = dispatcher.publish(Some("u1"), &[upsert("articles", "a1")]);
        assert_eq!(delivered, 1);
        assert_eq!(dispatcher.retained("c1"), 1);
        assert_eq!(dispatcher.retained("c2"), 0);
    }

    #[test]
    fn test_connected_client_gets_immediate_push() {
        let dispatcher = EventDispatcher::new();
        let outbound = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = outbound.clone();

        dispatcher.subscribe_changes("c1", "articles", &ChangeKind::ALL);
        dispatcher.on_client_request("c1", None, &remote);
        dispatcher.publish(None, &[upsert("articles", "a1")]);

        let received = events(&outbound);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].seq, 1);
        // still retained until acknowledged
        assert_eq!(dispatcher.retained("c1"), 1);
    }

    #[test]
    fn test_request_resends_unacknowledged_events() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe_changes("c1", "articles", &ChangeKind::ALL);
        for i in 0..5 {
            dispatcher.publish(None, &[upsert("articles", &format!("a{i}"))]);
        }

        let outbound = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = outbound.clone();
        dispatcher.on_client_request("c1", Some(3), &remote);

        let seqs: Vec<i64> = events(&outbound).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_failed_push_keeps_event_for_resend() {
        let dispatcher = EventDispatcher::new();
        let outbound = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = outbound.clone();

        dispatcher.subscribe_message("c1", "chat.*", true);
        dispatcher.on_client_request("c1", None, &remote);
        outbound.close();

        let seq = dispatcher
            .send_event("c1", None, vec![EventPayload::Message {
                name: "chat.hello".to_string(),
                param: json!("hi"),
            }])
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(dispatcher.retained("c1"), 1);
        assert_eq!(dispatcher.stats().connected, 0);
    }

    #[test]
    fn test_detach_drops_idle_client() {
        let dispatcher = EventDispatcher::new();
        let outbound = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = outbound.clone();

        dispatcher.on_client_request("c1", None, &remote);
        assert_eq!(dispatcher.stats().clients, 1);

        dispatcher.detach("c1", remote.connection_id());
        assert_eq!(dispatcher.stats().clients, 0);
    }

    #[test]
    fn test_detach_keeps_subscribed_client() {
        let dispatcher = EventDispatcher::new();
        let outbound = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = outbound.clone();

        dispatcher.subscribe_changes("c1", "articles", &ChangeKind::ALL);
        dispatcher.on_client_request("c1", None, &remote);
        dispatcher.detach("c1", remote.connection_id());

        let stats = dispatcher.stats();
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.connected, 0);
    }

    #[test]
    fn test_seq_continues_after_client_is_disposed() {
        let dispatcher = EventDispatcher::new();
        let first = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = first.clone();

        dispatcher.on_client_request("c1", None, &remote);
        for _ in 0..3 {
            dispatcher.send_event("c1", None, vec![upsert("articles", "a1")]).unwrap();
        }
        assert_eq!(events(&first).len(), 3);
        dispatcher.on_client_request("c1", Some(3), &remote);
        dispatcher.detach("c1", remote.connection_id());
        assert_eq!(dispatcher.stats().clients, 0);

        let second = Arc::new(RecordingOutbound::new());
        let remote: Arc<dyn Outbound> = second.clone();
        dispatcher.on_client_request("c1", Some(3), &remote);
        let seq = dispatcher.send_event("c1", None, vec![upsert("articles", "a2")]).unwrap();
        assert_eq!(seq, 4);

        let received: Vec<i64> = events(&second).iter().map(|e| e.seq).collect();
        assert_eq!(received, vec![4]);
    }

    #[test]
    fn test_detach_from_stale_connection_is_ignored() {
        let dispatcher = EventDispatcher::new();
        let old: Arc<dyn Outbound> = Arc::new(RecordingOutbound::new());
        let new: Arc<dyn Outbound> = Arc::new(RecordingOutbound::new());

        dispatcher.subscribe_changes("c1", "articles", &ChangeKind::ALL);
        dispatcher.on_client_request("c1", None, &old);
        dispatcher.on_client_request("c1", None, &new);
        dispatcher.detach("c1", old.connection_id());

        assert_eq!(dispatcher.stats().connected, 1);
    }
}
