//! WebSocket connection driver
//!
//! Runs over any stream that already completed the HTTP upgrade. One task
//! reads and reassembles messages; one writer task owns the write half and
//! drains an unbounded channel, so responses and pushed events from any
//! number of producers reach the socket one frame at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::frame::{close_code, Opcode, Role};
use super::reader::{FrameReader, ReadStatus};
use super::writer::FrameWriter;
use crate::client::{ClientHub, ClientIdentity};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::event::ClientEvents;
use crate::host::Hub;
use crate::transport::{next_connection_id, Outbound};

const INITIAL_MESSAGE_BUFFER: usize = 4096;

enum Outgoing {
    Message(Bytes),
    Close { status: u16, reason: String },
}

/// Outbound half of a WebSocket connection
struct WsOutbound {
    id: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
    max_message_size: usize,
    closed: AtomicBool,
}

impl WsOutbound {
    fn new(tx: mpsc::UnboundedSender<Outgoing>, max_message_size: usize) -> Self {
        Self {
            id: next_connection_id(),
            tx,
            max_message_size,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a Close frame and refuse further messages
    fn close(&self, status: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Outgoing::Close {
            status,
            reason: reason.to_string(),
        });
    }
}

impl Outbound for WsOutbound {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn send(&self, message: Bytes) -> HubResult<()> {
        if message.len() > self.max_message_size {
            return Err(HubError::MessageTooLarge {
                size: message.len(),
                limit: self.max_message_size,
            });
        }
        if !self.is_open() {
            return Err(HubError::ConnectionClosed);
        }
        self.tx
            .send(Outgoing::Message(message))
            .map_err(|_| HubError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Single writer: the only code that touches the write half
async fn run_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>, frames: FrameWriter)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_MESSAGE_BUFFER);
    while let Some(outgoing) = rx.recv().await {
        buf.clear();
        let is_close = match outgoing {
            Outgoing::Message(message) => {
                frames.write_message(Opcode::Text, &message, &mut buf);
                false
            }
            Outgoing::Close { status, reason } => {
                frames.write_close(status, &reason, &mut buf);
                true
            }
        };
        if let Err(e) = writer.write_all(&buf).await {
            debug!("websocket write failed: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

/// How the read loop ended
#[derive(Debug)]
enum ReadEnd {
    /// Peer sent Close
    Closed { status: Option<u16>, reason: String },
    /// End of stream or local cancellation
    Finished,
}

/// Read frames until Close, EOF, cancellation or a fatal error, handing
/// every complete data message to `on_message`
async fn read_messages<R, F>(
    mut reader: R,
    config: &HubConfig,
    cancel: &CancellationToken,
    mut on_message: F,
) -> HubResult<ReadEnd>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let max_message = config.max_message_size;
    let mut frames = FrameReader::new(config.websocket.max_frame_size as u64);
    let mut input = vec![0u8; config.websocket.read_buffer_size];
    let mut message: Vec<u8> = Vec::new();
    let mut written = 0usize;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(ReadEnd::Finished),
            read = reader.read(&mut input) => read?,
        };
        if n == 0 {
            if !frames.is_idle() {
                warn!("stream ended inside a frame");
            }
            return Ok(ReadEnd::Finished);
        }

        let mut pos = 0;
        while pos < n {
            if written == message.len() && message.len() < max_message {
                let grown = (message.len() * 2)
                    .max(INITIAL_MESSAGE_BUFFER)
                    .min(max_message);
                message.resize(grown, 0);
            }

            let progress = frames.read(&input[pos..n], &mut message[written..])?;
            pos += progress.consumed;
            written += progress.written;

            match progress.status {
                // payload bytes remain but the message already fills the limit
                ReadStatus::BufferFull if written >= max_message => {
                    return Err(HubError::MessageTooLarge {
                        size: written + 1,
                        limit: max_message,
                    });
                }
                ReadStatus::FrameComplete => {}
                _ => continue,
            }
            match frames.opcode() {
                Opcode::Close => {
                    return Ok(ReadEnd::Closed {
                        status: frames.close_status(),
                        reason: frames
                            .close_status_description()
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
                Opcode::Ping | Opcode::Pong => {
                    trace!(opcode = ?frames.opcode(), "control frame ignored");
                }
                _ if frames.end_of_message() => {
                    on_message(&message[..written]);
                    written = 0;
                }
                _ => {}
            }
        }
    }
}

fn close_for_error(error: &HubError) -> (u16, String) {
    match error {
        HubError::MessageTooLarge { .. } => (close_code::MESSAGE_TOO_BIG, error.to_string()),
        HubError::Frame(e) => (close_code::PROTOCOL_ERROR, e.to_string()),
        _ => (close_code::GOING_AWAY, String::new()),
    }
}

/// Serve one upgraded connection as a hub host until it closes
#[instrument(skip_all, fields(connection_id = tracing::field::Empty))]
pub async fn serve_host<S>(stream: S, hub: Arc<Hub>, cancel: CancellationToken) -> HubResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = hub.config().clone();
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let outbound = Arc::new(WsOutbound::new(tx, config.max_message_size));
    tracing::Span::current().record("connection_id", outbound.id);

    let writer_task = tokio::spawn(run_writer(writer, rx, FrameWriter::new(Role::Server)));
    let host = hub.connect(outbound.clone());
    info!("websocket host connected");

    let result = read_messages(reader, &config, &cancel, |message| host.on_receive(message)).await;
    match &result {
        Ok(ReadEnd::Closed { status, reason }) => {
            info!(?status, reason = reason.as_str(), "peer closed connection");
            outbound.close(close_code::NORMAL, "");
        }
        Ok(ReadEnd::Finished) => outbound.close(close_code::GOING_AWAY, ""),
        Err(e) => {
            warn!("websocket connection failed: {}", e);
            let (status, reason) = close_for_error(e);
            outbound.close(status, &reason);
        }
    }

    host.close();
    let _ = writer_task.await;
    info!("websocket host disconnected");
    result.map(|_| ())
}

/// Run the client side over an upgraded stream.
///
/// Returns the hub for issuing requests and the task driving the connection.
/// The task ends when the peer closes or [`ClientHub::close`] is called;
/// either way every pending request is cancelled.
pub fn connect_client<S>(
    stream: S,
    identity: ClientIdentity,
    events: Arc<ClientEvents>,
    config: &HubConfig,
) -> (Arc<ClientHub>, JoinHandle<HubResult<()>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = config.clone();
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let outbound = Arc::new(WsOutbound::new(tx, config.max_message_size));
    let writer_task = tokio::spawn(run_writer(writer, rx, FrameWriter::new(Role::Client)));

    let hub = Arc::new(ClientHub::new(outbound.clone(), identity, events));
    let driver = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move {
            let cancel = hub.cancellation_token();
            let result = read_messages(reader, &config, &cancel, |message| hub.on_receive(message)).await;
            match &result {
                Ok(ReadEnd::Closed { status, .. }) => {
                    debug!(?status, "hub closed connection");
                    outbound.close(close_code::NORMAL, "");
                }
                Ok(ReadEnd::Finished) => outbound.close(close_code::NORMAL, ""),
                Err(e) => {
                    warn!("websocket connection failed: {}", e);
                    let (status, reason) = close_for_error(e);
                    outbound.close(status, &reason);
                }
            }
            hub.close();
            let _ = writer_task.await;
            result.map(|_| ())
        }
    });
    (hub, driver)
}
