//! HTTP monitoring API
//!
//! Health check and hub counters for operators. The sync protocol itself runs
//! over the WebSocket and UDP transports, not over HTTP.

pub mod http;

pub use http::create_router;
