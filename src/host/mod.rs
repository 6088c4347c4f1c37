//! Server side of the duplex correlation layer
//!
//! A [`Hub`] is shared by every connection of one server instance and owns the
//! executor, the event dispatcher and the context pool. Each transport
//! connection gets a [`Host`] from [`Hub::connect`] and feeds it raw messages
//! through [`Host::on_receive`]. Requests execute concurrently, so responses
//! leave in completion order, not arrival order.

mod context;
mod executor;

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

pub use context::{ContextPool, SyncContext};
pub use executor::{
    panic_message, ExecuteContext, ExecuteRequest, InlineExecutor, PoolExecutor, QueuedExecutor,
    SyncHandler, SyncResult, TaskExecutor,
};

use crate::config::HubConfig;
use crate::error::HubResult;
use crate::event::{DispatcherStats, EventDispatcher};
use crate::protocol::{
    decode_message, recover_req_id, ErrorResponse, ProtocolMessage, SyncRequest, SyncResponse,
};
use crate::transport::Outbound;

/// Counters exposed by [`Hub::stats`]
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub requests: u64,
    pub parse_errors: u64,
    pub pooled_contexts: usize,
    pub events: DispatcherStats,
}

/// State shared by every connection of one server instance
pub struct Hub {
    executor: Arc<dyn TaskExecutor>,
    events: Arc<EventDispatcher>,
    contexts: ContextPool,
    config: HubConfig,
    next_client_id: AtomicU64,
    connections: AtomicUsize,
    requests: AtomicU64,
    parse_errors: AtomicU64,
}

impl Hub {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        events: Arc<EventDispatcher>,
        config: HubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            events,
            contexts: ContextPool::new(config.max_pooled_contexts, config.max_message_size),
            config,
            next_client_id: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    /// Attach a new connection
    pub fn connect(self: &Arc<Self>, outbound: Arc<dyn Outbound>) -> Host {
        self.connections.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = outbound.connection_id(), "host connected");
        Host {
            hub: Arc::clone(self),
            outbound,
            clients: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            pooled_contexts: self.contexts.pooled(),
            events: self.events.stats(),
        }
    }

    fn assign_client_id(&self) -> String {
        format!("c{}", self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// One connection's view of the hub
pub struct Host {
    hub: Arc<Hub>,
    outbound: Arc<dyn Outbound>,
    /// Client ids seen on this connection, detached on close
    clients: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Host {
    pub fn connection_id(&self) -> u64 {
        self.outbound.connection_id()
    }

    /// Handle one raw message. Never fails: every problem is answered with an
    /// error response and the connection keeps going.
    pub fn on_receive(&self, raw: &[u8]) {
        let request = match decode_message(raw) {
            Ok(ProtocolMessage::Request(request)) => request,
            Ok(other) => {
                warn!(
                    connection_id = self.connection_id(),
                    req_id = ?other.req_id(),
                    "expected a sync request"
                );
                let response =
                    ErrorResponse::bad_request(other.req_id(), "expected a sync request".into());
                self.send_now(&ProtocolMessage::Error(response));
                return;
            }
            Err(e) => {
                self.hub.parse_errors.fetch_add(1, Ordering::Relaxed);
                let req_id = recover_req_id(raw);
                warn!(
                    connection_id = self.connection_id(),
                    ?req_id,
                    "failed to parse request: {}",
                    e
                );
                self.send_now(&ProtocolMessage::Error(ErrorResponse::parse_error(
                    req_id,
                    e.to_string(),
                )));
                return;
            }
        };
        self.handle_request(request);
    }

    fn handle_request(&self, request: SyncRequest) {
        self.hub.requests.fetch_add(1, Ordering::Relaxed);

        let SyncRequest {
            req_id,
            user_id,
            token,
            client_id,
            event_ack,
            tasks,
        } = request;
        let client_id = client_id.unwrap_or_else(|| self.hub.assign_client_id());
        self.clients.lock().insert(client_id.clone());
        self.hub
            .events
            .on_client_request(&client_id, event_ack, &self.outbound);

        let task_count = tasks.len();
        let execute = ExecuteRequest {
            context: ExecuteContext {
                client_id: client_id.clone(),
                user_id,
                token,
            },
            tasks,
        };

        let hub = Arc::clone(&self.hub);
        let outbound = Arc::clone(&self.outbound);
        let mut context = hub.contexts.acquire();
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(hub.executor.execute(execute))
                .catch_unwind()
                .await;
            let message = build_response(req_id, client_id, task_count, outcome);

            match context.encode(&message) {
                Ok(bytes) => {
                    if let Err(e) = outbound.send(bytes) {
                        debug!(?req_id, "response dropped: {}", e);
                    }
                }
                Err(e) => error!(?req_id, "failed to encode response: {}", e),
            }
            hub.contexts.release(context);
        });
    }

    fn send_now(&self, message: &ProtocolMessage) {
        let mut context = self.hub.contexts.acquire();
        match context.encode(message) {
            Ok(bytes) => {
                if let Err(e) = self.outbound.send(bytes) {
                    debug!(connection_id = self.connection_id(), "error response dropped: {}", e);
                }
            }
            Err(e) => error!("failed to encode error response: {}", e),
        }
        self.hub.contexts.release(context);
    }

    /// Detach from the event dispatcher. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection_id = self.connection_id();
        for client_id in self.clients.lock().drain() {
            self.hub.events.detach(&client_id, connection_id);
        }
        self.hub.connections.fetch_sub(1, Ordering::Relaxed);
        debug!(connection_id, "host closed");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_response(
    req_id: Option<i64>,
    client_id: String,
    task_count: usize,
    outcome: Result<HubResult<SyncResult>, Box<dyn Any + Send>>,
) -> ProtocolMessage {
    match outcome {
        Ok(Ok(result)) if result.results.len() == task_count => {
            ProtocolMessage::Response(SyncResponse {
                req_id,
                client_id: Some(client_id),
                results: result.results,
                auth_error: result.auth_error,
            })
        }
        Ok(Ok(result)) => {
            error!(
                ?req_id,
                expected = task_count,
                actual = result.results.len(),
                "executor returned wrong number of results"
            );
            ProtocolMessage::Error(ErrorResponse::server_error(
                req_id,
                format!(
                    "expected {} results, got {}",
                    task_count,
                    result.results.len()
                ),
            ))
        }
        Ok(Err(e)) => ProtocolMessage::Error(ErrorResponse::exception(req_id, e.to_string())),
        Err(payload) => {
            let message = panic_message(payload);
            error!(?req_id, "executor panicked: {}", message);
            ProtocolMessage::Error(ErrorResponse::exception(req_id, message))
        }
    }
}
