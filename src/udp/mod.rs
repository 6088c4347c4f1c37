//! UDP transport: one message per datagram, no fragmentation
//!
//! Both ends funnel every outbound datagram through a single [`SendQueue`]
//! per socket. The server keys sessions by remote `(address, port)`.

mod client;
mod send_queue;
mod server;

pub use client::UdpClient;
pub use send_queue::{SendQueue, UdpOutbound};
pub use server::{UdpServer, UdpSession};
