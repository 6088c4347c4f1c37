//! UDP client transport

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::send_queue::{SendQueue, UdpOutbound};
use crate::client::{ClientHub, ClientIdentity};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::event::ClientEvents;

/// Client endpoint on one local socket
pub struct UdpClient {
    hub: Arc<ClientHub>,
    local_addr: SocketAddr,
    receiver: JoinHandle<()>,
}

impl UdpClient {
    /// Bind `local` (or an OS-assigned port) and talk to `remote`
    pub async fn connect(
        remote: SocketAddr,
        local: Option<SocketAddr>,
        identity: ClientIdentity,
        events: Arc<ClientEvents>,
        config: &HubConfig,
    ) -> HubResult<Self> {
        let local = local.unwrap_or_else(|| {
            if remote.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            }
        });
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let local_addr = socket.local_addr()?;

        let cancel = CancellationToken::new();
        let (queue, _send_task) =
            SendQueue::start(Arc::clone(&socket), config.max_message_size, cancel.clone());
        let outbound = Arc::new(UdpOutbound::new(queue, remote));
        let hub = Arc::new(ClientHub::with_cancellation(
            outbound,
            identity,
            events,
            cancel.clone(),
        ));

        let receiver = tokio::spawn(run_receiver(
            socket,
            remote,
            config.udp.buffer_size,
            Arc::clone(&hub),
            cancel,
        ));
        info!(%local_addr, %remote, "udp client started");

        Ok(Self {
            hub,
            local_addr,
            receiver,
        })
    }

    pub fn hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel pending requests and stop both loops
    pub async fn close(self) {
        self.hub.close();
        let _ = self.receiver.await;
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    buffer_size: usize,
    hub: Arc<ClientHub>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) if from == remote => hub.on_receive(&buf[..len]),
                Ok((_, from)) => debug!(%from, "datagram from unknown endpoint ignored"),
                Err(e) => warn!("udp receive failed: {}", e),
            },
        }
    }
    hub.close();
    debug!("udp client receiver stopped");
}
