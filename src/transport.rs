//! Outbound side of a connection, shared by hosts, clients and the event queue

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::HubResult;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Serialized outbound channel of one connection.
///
/// Implementations must not write to the socket directly from `send`: every
/// message goes through one queue drained by a single writer, so responses and
/// pushed events never interleave on the wire. `send` must not block.
pub trait Outbound: Send + Sync {
    fn connection_id(&self) -> u64;

    /// Queue one complete message for delivery
    fn send(&self, message: Bytes) -> HubResult<()>;

    fn is_open(&self) -> bool;
}
