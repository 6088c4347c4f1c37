//! Hub Sync
//!
//! Batched database requests and reliable change events between clients and
//! a hub, over WebSocket or UDP.
//!
//! # Features
//!
//! - **Duplex correlation**: many requests in flight per connection, responses
//!   matched by `reqId` in completion order
//! - **WebSocket framing**: resumable RFC 6455 frame reader and writer
//! - **UDP transport**: per-endpoint sessions, one serialized send loop per socket
//! - **Reliable events**: per-client seq numbers, ack-based retention, resend
//!   on every request
//!
//! # Modules
//!
//! - `types`: Tasks, results, events and subscriptions
//! - `protocol`: Wire messages and their JSON codec
//! - `host`: Server side of the correlation layer and execution modes
//! - `client`: Client side of the correlation layer
//! - `event`: Event queues, dispatcher and client-side application
//! - `websocket`: Frame codec and connection driver
//! - `udp`: UDP server, client and send queue
//! - `database`: In-memory task handler
//! - `api`: HTTP monitoring endpoints
//! - `config`, `error`, `utils`: Configuration, errors, logging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hub_sync::{EventDispatcher, Hub, HubConfig, InlineExecutor, MemoryDatabase, UdpServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hub_sync::HubResult<()> {
//!     let events = Arc::new(EventDispatcher::new());
//!     let db = Arc::new(MemoryDatabase::new(Arc::clone(&events)));
//!     let hub = Hub::new(Arc::new(InlineExecutor::new(db)), events, HubConfig::default());
//!
//!     let server = UdpServer::bind("127.0.0.1:7400".parse().unwrap(), hub, CancellationToken::new()).await?;
//!     server.run().await
//! }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod event;
pub mod host;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod udp;
pub mod utils;
pub mod websocket;

// Re-export commonly used items at crate root
pub use client::{ClientHub, ClientIdentity};
pub use config::HubConfig;
pub use database::MemoryDatabase;
pub use error::{HubError, HubResult};
pub use event::{ClientEvents, EventDelivery, EventDispatcher};
pub use host::{Host, Hub, InlineExecutor, PoolExecutor, QueuedExecutor, SyncHandler, TaskExecutor};
pub use protocol::{ProtocolMessage, SyncRequest, SyncResponse};
pub use transport::Outbound;
pub use types::{ChangeKind, EventMessage, EventPayload, SyncTask, TaskResult};
pub use udp::{UdpClient, UdpServer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
