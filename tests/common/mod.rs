//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hub_sync::protocol::decode_message;
use hub_sync::transport::next_connection_id;
use hub_sync::{
    EventDispatcher, Hub, HubConfig, HubError, HubResult, InlineExecutor, MemoryDatabase,
    Outbound, ProtocolMessage, TaskExecutor,
};
use tokio::sync::{mpsc, Mutex};

/// Hub backed by the in-memory database
pub fn memory_hub() -> Arc<Hub> {
    memory_hub_with(HubConfig::default())
}

pub fn memory_hub_with(config: HubConfig) -> Arc<Hub> {
    let events = Arc::new(EventDispatcher::new());
    let db = Arc::new(MemoryDatabase::new(Arc::clone(&events)));
    Hub::new(Arc::new(InlineExecutor::new(db)), events, config)
}

pub fn hub_with_executor(executor: Arc<dyn TaskExecutor>) -> Arc<Hub> {
    Hub::new(executor, Arc::new(EventDispatcher::new()), HubConfig::default())
}

/// Outbound that forwards every message into a channel
pub struct ChannelOutbound {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl ChannelOutbound {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: next_connection_id(),
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Next message, or panic after a second
    pub async fn next(&self) -> ProtocolMessage {
        let mut rx = self.rx.lock().await;
        let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed");
        decode_message(&raw).expect("hub sent invalid json")
    }

    /// Messages received so far without waiting
    pub async fn drain(&self) -> Vec<ProtocolMessage> {
        let mut rx = self.rx.lock().await;
        let mut messages = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            messages.push(decode_message(&raw).expect("hub sent invalid json"));
        }
        messages
    }
}

impl Outbound for ChannelOutbound {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn send(&self, message: Bytes) -> HubResult<()> {
        self.tx.send(message).map_err(|_| HubError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
