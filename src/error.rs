//! Crate-wide error type

use crate::protocol::ErrorKind;
use crate::websocket::FrameError;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Errors surfaced by transports, the correlation layer and executors
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed WebSocket frame. Fatal to the connection.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The request was pending when its connection closed.
    #[error("request cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Request-level error returned by the remote hub.
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("execution failed: {0}")]
    Execute(String),

    #[error("invalid config: {0}")]
    Config(String),
}
