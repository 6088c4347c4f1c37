//! UDP hub server with per-endpoint sessions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::send_queue::{SendQueue, UdpOutbound};
use crate::error::HubResult;
use crate::host::{Host, Hub};

/// Host state of one remote `(address, port)`
pub struct UdpSession {
    remote: SocketAddr,
    host: Host,
    last_seen: Mutex<Instant>,
}

impl UdpSession {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    hub: Arc<Hub>,
    queue: SendQueue,
    sessions: DashMap<SocketAddr, Arc<UdpSession>>,
    cancel: CancellationToken,
}

impl UdpServer {
    /// Bind the socket and start its send loop
    pub async fn bind(
        addr: SocketAddr,
        hub: Arc<Hub>,
        cancel: CancellationToken,
    ) -> HubResult<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (queue, _send_task) = SendQueue::start(
            Arc::clone(&socket),
            hub.config().max_message_size,
            cancel.clone(),
        );
        info!(addr = %socket.local_addr()?, "udp server bound");
        Ok(Arc::new(Self {
            socket,
            hub,
            queue,
            sessions: DashMap::new(),
            cancel,
        }))
    }

    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Datagrams sent so far
    pub fn sent(&self) -> u64 {
        self.queue.sent()
    }

    /// Receive loop. Runs until the cancellation token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>) -> HubResult<()> {
        let mut buf = vec![0u8; self.hub.config().udp.buffer_size];
        let idle = self.hub.config().udp.session_idle();
        let mut sweep = tokio::time::interval(idle.max(std::time::Duration::from_secs(1)));
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => {
                    let evicted = self.evict_idle(idle);
                    if evicted > 0 {
                        info!(evicted, remaining = self.session_count(), "idle udp sessions evicted");
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => {
                        let session = self.session(remote);
                        session.touch();
                        session.host.on_receive(&buf[..len]);
                    }
                    // e.g. ICMP port unreachable surfacing on some platforms
                    Err(e) => warn!("udp receive failed: {}", e),
                },
            }
        }

        for entry in self.sessions.iter() {
            entry.host.close();
        }
        self.sessions.clear();
        info!("udp server stopped");
        Ok(())
    }

    fn session(&self, remote: SocketAddr) -> Arc<UdpSession> {
        if let Some(session) = self.sessions.get(&remote) {
            return Arc::clone(&session);
        }
        self.sessions
            .entry(remote)
            .or_insert_with(|| {
                debug!(%remote, "udp session created");
                let outbound = Arc::new(UdpOutbound::new(self.queue.clone(), remote));
                Arc::new(UdpSession {
                    remote,
                    host: self.hub.connect(outbound),
                    last_seen: Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    /// Drop sessions idle for longer than `idle`. Returns how many.
    pub fn evict_idle(&self, idle: std::time::Duration) -> usize {
        let stale: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > idle)
            .map(|s| *s.key())
            .collect();

        let mut evicted = 0;
        for remote in stale {
            if let Some((_, session)) = self.sessions.remove_if(&remote, |_, s| s.idle_for() > idle) {
                session.host.close();
                evicted += 1;
            }
        }
        evicted
    }
}
