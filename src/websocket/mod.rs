//! WebSocket framing (RFC 6455) and the connection driver built on it
//!
//! The upgrade handshake happens outside this module. Everything from the
//! first frame onwards is handled here: the resumable [`FrameReader`], the
//! [`FrameWriter`] and the per-connection read loop and writer task.

pub mod connection;
mod frame;
mod reader;
mod writer;

pub use connection::{connect_client, serve_host};
pub use frame::{close_code, FrameError, Opcode, Role, MAX_CONTROL_PAYLOAD};
pub use reader::{FrameReader, ReadProgress, ReadStatus};
pub use writer::{encode_frame, FrameWriter};
