//! Data types shared by the hub and its clients
//!
//! Tasks and their results travel inside sync requests and responses.
//! Event messages carry mutation notifications to subscribed clients.

mod event;
mod subscription;
mod task;

pub use event::{entity_key, ChangeKind, EventMessage, EventPayload};
pub use subscription::Subscription;
pub use task::{SyncTask, TaskError, TaskErrorKind, TaskResult};
