//! JSON encoding of protocol messages

use bytes::Bytes;
use serde_json::Value;

use super::message::ProtocolMessage;
use crate::error::HubResult;

/// Parse a raw message
pub fn decode_message(raw: &[u8]) -> Result<ProtocolMessage, serde_json::Error> {
    serde_json::from_slice(raw)
}

/// Best-effort recovery of `reqId` from a message that failed to parse
pub fn recover_req_id(raw: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    value.get("reqId").and_then(Value::as_i64)
}

/// Serialize into a reusable buffer, replacing its content
pub fn encode_into(message: &ProtocolMessage, buf: &mut Vec<u8>) -> HubResult<()> {
    buf.clear();
    serde_json::to_writer(&mut *buf, message)?;
    Ok(())
}

/// Serialize into a fresh buffer
pub fn encode_message(message: &ProtocolMessage) -> HubResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}
