//! Event message types pushed from the hub to subscribed clients

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A mutation notification for one client.
///
/// `seq` is assigned per client, starts at 1 and never skips a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub client_id: String,
    pub seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_user_id: Option<String>,
    pub payload: Vec<EventPayload>,
    /// Unix timestamp (millis) when the event was created
    #[serde(default)]
    pub timestamp: i64,
}

/// One change or message carried by an [`EventMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    Create {
        container: String,
        entities: Vec<Value>,
    },
    Upsert {
        container: String,
        entities: Vec<Value>,
    },
    Delete {
        container: String,
        ids: Vec<String>,
    },
    /// JSON merge patches, each carrying the `id` of its target
    Merge {
        container: String,
        patches: Vec<Value>,
    },
    Message {
        name: String,
        #[serde(default)]
        param: Value,
    },
}

impl EventPayload {
    /// Container name for change payloads
    pub fn container(&self) -> Option<&str> {
        match self {
            EventPayload::Create { container, .. }
            | EventPayload::Upsert { container, .. }
            | EventPayload::Delete { container, .. }
            | EventPayload::Merge { container, .. } => Some(container),
            EventPayload::Message { .. } => None,
        }
    }

    /// Change kind for change payloads
    pub fn change_kind(&self) -> Option<ChangeKind> {
        match self {
            EventPayload::Create { .. } => Some(ChangeKind::Create),
            EventPayload::Upsert { .. } => Some(ChangeKind::Upsert),
            EventPayload::Delete { .. } => Some(ChangeKind::Delete),
            EventPayload::Merge { .. } => Some(ChangeKind::Merge),
            EventPayload::Message { .. } => None,
        }
    }
}

/// Kinds of container changes a client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Create,
    Upsert,
    Delete,
    Merge,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 4] = [
        ChangeKind::Create,
        ChangeKind::Upsert,
        ChangeKind::Delete,
        ChangeKind::Merge,
    ];
}

/// Stable key of an entity: its `id` field as a string
pub fn entity_key(entity: &Value) -> Option<String> {
    match entity.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
