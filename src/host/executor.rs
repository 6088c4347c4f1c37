//! Task execution capability and the three execution modes
//!
//! The host is agnostic to where tasks run: it awaits whatever future the
//! [`TaskExecutor`] returns. [`SyncHandler`] is the synchronous collaborator
//! interface, adapted by [`InlineExecutor`], [`PoolExecutor`] and
//! [`QueuedExecutor`].

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{HubError, HubResult};
use crate::types::{SyncTask, TaskResult};

/// Identity of the caller, taken from the request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteContext {
    pub client_id: String,
    pub user_id: Option<String>,
    pub token: Option<String>,
}

/// A parsed batch handed to the executor
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub context: ExecuteContext,
    pub tasks: Vec<SyncTask>,
}

/// Outcome of a batch: one result per task, in task order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub results: Vec<TaskResult>,
    pub auth_error: Option<String>,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> HubResult<SyncResult>;
}

/// Synchronous task handler
pub trait SyncHandler: Send + Sync + 'static {
    fn handle(&self, request: &ExecuteRequest) -> SyncResult;
}

/// Render a panic payload as text
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task handler panicked".to_string()
    }
}

fn run_guarded<H: SyncHandler + ?Sized>(handler: &H, request: &ExecuteRequest) -> HubResult<SyncResult> {
    catch_unwind(AssertUnwindSafe(|| handler.handle(request))).map_err(|payload| {
        let message = panic_message(payload);
        error!(client_id = request.context.client_id.as_str(), "task handler panicked: {}", message);
        HubError::Execute(message)
    })
}

/// Runs the handler on the task that received the request
pub struct InlineExecutor<H> {
    handler: Arc<H>,
}

impl<H: SyncHandler> InlineExecutor<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: SyncHandler> TaskExecutor for InlineExecutor<H> {
    async fn execute(&self, request: ExecuteRequest) -> HubResult<SyncResult> {
        run_guarded(self.handler.as_ref(), &request)
    }
}

/// Dispatches the handler to a rayon thread pool
pub struct PoolExecutor<H> {
    handler: Arc<H>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl<H: SyncHandler> PoolExecutor<H> {
    /// Use rayon's global pool
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            pool: None,
        }
    }

    /// Use a dedicated pool with `threads` workers
    pub fn with_threads(handler: Arc<H>, threads: usize) -> HubResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hub-exec-{i}"))
            .build()
            .map_err(|e| HubError::Config(e.to_string()))?;
        Ok(Self {
            handler,
            pool: Some(Arc::new(pool)),
        })
    }
}

#[async_trait]
impl<H: SyncHandler> TaskExecutor for PoolExecutor<H> {
    async fn execute(&self, request: ExecuteRequest) -> HubResult<SyncResult> {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::clone(&self.handler);
        let job = move || {
            let _ = tx.send(run_guarded(handler.as_ref(), &request));
        };
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
        rx.await
            .map_err(|_| HubError::Execute("execution dropped".to_string()))?
    }
}

struct QueuedJob {
    request: ExecuteRequest,
    reply: oneshot::Sender<HubResult<SyncResult>>,
}

/// Holds requests until the owning loop calls [`QueuedExecutor::process_pending`]
pub struct QueuedExecutor<H> {
    handler: Arc<H>,
    jobs: Mutex<VecDeque<QueuedJob>>,
}

impl<H: SyncHandler> QueuedExecutor<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    /// Run every queued request on the calling thread. Returns the count.
    pub fn process_pending(&self) -> usize {
        let jobs: Vec<QueuedJob> = self.jobs.lock().drain(..).collect();
        let count = jobs.len();
        for job in jobs {
            let result = run_guarded(self.handler.as_ref(), &job.request);
            if job.reply.send(result).is_err() {
                debug!("queued request abandoned before completion");
            }
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }
}

#[async_trait]
impl<H: SyncHandler> TaskExecutor for QueuedExecutor<H> {
    async fn execute(&self, request: ExecuteRequest) -> HubResult<SyncResult> {
        let (reply, rx) = oneshot::channel();
        self.jobs.lock().push_back(QueuedJob { request, reply });
        rx.await
            .map_err(|_| HubError::Execute("execution dropped".to_string()))?
    }
}
