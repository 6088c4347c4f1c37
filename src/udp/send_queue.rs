//! Serialized datagram send loop

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};
use crate::transport::{next_connection_id, Outbound};

struct Datagram {
    target: SocketAddr,
    payload: Bytes,
}

/// Handle to the one loop that owns sending on a socket.
///
/// Cloned into every session. At most one `send_to` is outstanding on the
/// socket at any time.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Datagram>,
    max_datagram: usize,
    sent: Arc<AtomicU64>,
}

impl SendQueue {
    /// Spawn the send loop. It stops on cancellation or when every handle is
    /// dropped.
    pub fn start(
        socket: Arc<UdpSocket>,
        max_datagram: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_send_loop(socket, rx, Arc::clone(&sent), cancel));
        (
            Self {
                tx,
                max_datagram,
                sent,
            },
            task,
        )
    }

    pub fn enqueue(&self, target: SocketAddr, payload: Bytes) -> HubResult<()> {
        if payload.len() > self.max_datagram {
            return Err(HubError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_datagram,
            });
        }
        self.tx
            .send(Datagram { target, payload })
            .map_err(|_| HubError::ConnectionClosed)
    }

    /// Datagrams handed to the socket so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

async fn run_send_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Datagram>,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(datagram) => datagram,
                None => break,
            },
        };
        match socket.send_to(&datagram.payload, datagram.target).await {
            Ok(_) => {
                sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(remote = %datagram.target, "udp send failed: {}", e),
        }
    }
    debug!("udp send loop stopped");
}

/// Outbound channel to one remote endpoint through a shared [`SendQueue`]
pub struct UdpOutbound {
    id: u64,
    queue: SendQueue,
    target: SocketAddr,
}

impl UdpOutbound {
    pub fn new(queue: SendQueue, target: SocketAddr) -> Self {
        Self {
            id: next_connection_id(),
            queue,
            target,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Outbound for UdpOutbound {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn send(&self, message: Bytes) -> HubResult<()> {
        self.queue.enqueue(self.target, message)
    }

    fn is_open(&self) -> bool {
        self.queue.is_running()
    }
}
