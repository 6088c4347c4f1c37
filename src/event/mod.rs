//! Event reliability layer
//!
//! Server side: per-client queues with acknowledgment-based retention and
//! resend ([`EventDispatcher`]). Client side: ordered, idempotent application
//! of pushed events ([`ClientEvents`]).

mod client;
mod dispatcher;
mod queue;

pub use client::{
    merge_patch, ClientEventStats, ClientEvents, EventChanges, EventDelivery, EventHandler,
    LocalStore,
};
pub use dispatcher::{DispatcherStats, EventDispatcher};
pub use queue::{ClientEventQueue, QueuedEvent};
