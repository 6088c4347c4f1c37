//! Per-client event queue with acknowledgment-based retention

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::HubResult;
use crate::protocol::{encode_message, ProtocolMessage};
use crate::types::{EventMessage, EventPayload};

/// An event already encoded for the wire
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub seq: i64,
    pub encoded: Bytes,
}

/// FIFO of events for one client.
///
/// Every event with `seq > last_acked` is retained, whether or not it was
/// already pushed, so it can be resent after a reconnect.
#[derive(Debug)]
pub struct ClientEventQueue {
    client_id: String,
    last_seq: i64,
    last_acked: i64,
    events: VecDeque<QueuedEvent>,
}

impl ClientEventQueue {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            last_seq: 0,
            last_acked: 0,
            events: VecDeque::new(),
        }
    }

    /// Continue numbering after `last_seq`, treating everything up to it as
    /// acknowledged
    pub fn resume(client_id: impl Into<String>, last_seq: i64) -> Self {
        Self {
            last_seq,
            last_acked: last_seq,
            ..Self::new(client_id)
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Seq of the newest event ever enqueued
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    pub fn last_acked(&self) -> i64 {
        self.last_acked
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Assign the next seq and append the encoded event
    pub fn enqueue(
        &mut self,
        src_user_id: Option<&str>,
        payload: Vec<EventPayload>,
    ) -> HubResult<QueuedEvent> {
        let seq = self.last_seq + 1;
        let message = ProtocolMessage::Event(EventMessage {
            client_id: self.client_id.clone(),
            seq,
            src_user_id: src_user_id.map(str::to_string),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        let encoded = encode_message(&message)?;
        self.last_seq = seq;

        let event = QueuedEvent { seq, encoded };
        self.events.push_back(event.clone());
        Ok(event)
    }

    /// Drop every event with `seq <= ack`. Returns how many were removed.
    pub fn acknowledge(&mut self, ack: i64) -> usize {
        if ack <= self.last_acked {
            return 0;
        }
        self.last_acked = ack.min(self.last_seq);

        let mut removed = 0;
        while self.events.front().is_some_and(|e| e.seq <= ack) {
            self.events.pop_front();
            removed += 1;
        }
        removed
    }

    /// Retained events in ascending seq order
    pub fn retained(&self) -> impl Iterator<Item = &QueuedEvent> {
        self.events.iter()
    }
}
