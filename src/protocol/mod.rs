//! Wire protocol: message shapes and their JSON codec

mod codec;
mod message;

pub use codec::{decode_message, encode_into, encode_message, recover_req_id};
pub use message::{
    ErrorBody, ErrorKind, ErrorResponse, ProtocolMessage, SyncRequest, SyncResponse,
};
