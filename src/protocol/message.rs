//! Sync protocol messages

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{EventMessage, SyncTask, TaskResult};

/// Any message exchanged between a client and the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum ProtocolMessage {
    #[serde(rename = "sync")]
    Request(SyncRequest),
    #[serde(rename = "resp")]
    Response(SyncResponse),
    #[serde(rename = "error")]
    Error(ErrorResponse),
    #[serde(rename = "ev")]
    Event(EventMessage),
}

impl ProtocolMessage {
    /// Request id of requests and responses, if present
    pub fn req_id(&self) -> Option<i64> {
        match self {
            ProtocolMessage::Request(r) => r.req_id,
            ProtocolMessage::Response(r) => r.req_id,
            ProtocolMessage::Error(r) => r.req_id,
            ProtocolMessage::Event(_) => None,
        }
    }
}

/// A batch of tasks sent by a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Highest event seq the client has applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ack: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<SyncTask>,
}

/// Results of a successfully executed request.
/// `results[i]` belongs to `tasks[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub results: Vec<TaskResult>,
    /// Set when authentication failed. Task results then carry the denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<String>,
}

/// Request level failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<i64>,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The message body was not a valid request
    ParseError,
    /// Valid JSON but not acceptable as a request
    BadRequest,
    /// The executor produced an inconsistent result
    ServerError,
    /// Execution failed or panicked
    Exception,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ParseError => "ParseError",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::Exception => "Exception",
        };
        f.write_str(name)
    }
}

impl ErrorResponse {
    pub fn new(req_id: Option<i64>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            req_id,
            error: ErrorBody {
                message: message.into(),
                kind,
            },
        }
    }

    pub fn parse_error(req_id: Option<i64>, details: String) -> Self {
        Self::new(req_id, ErrorKind::ParseError, details)
    }

    pub fn bad_request(req_id: Option<i64>, details: String) -> Self {
        Self::new(req_id, ErrorKind::BadRequest, details)
    }

    pub fn server_error(req_id: Option<i64>, details: String) -> Self {
        Self::new(req_id, ErrorKind::ServerError, details)
    }

    pub fn exception(req_id: Option<i64>, details: String) -> Self {
        Self::new(req_id, ErrorKind::Exception, details)
    }
}
