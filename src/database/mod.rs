//! In-memory database - reference task handler
//!
//! Stores JSON entities per container, keyed by their `id` field, and
//! publishes every successful mutation to the [`EventDispatcher`] once per
//! request. Tasks:
//!
//! | task               | body                                        |
//! |--------------------|---------------------------------------------|
//! | `create`           | `container`, `entities`                     |
//! | `upsert`           | `container`, `entities`                     |
//! | `read`             | `container`, `ids?`                         |
//! | `delete`           | `container`, `ids`                          |
//! | `merge`            | `container`, `patches` (JSON merge patches) |
//! | `message`          | `name`, `param?`                            |
//! | `subscribeChanges` | `container`, `changes` (empty unsubscribes) |
//! | `subscribeMessage` | `name`, `remove?`                           |

mod crud;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::event::EventDispatcher;
use crate::host::{ExecuteRequest, SyncHandler, SyncResult};
use crate::types::{ChangeKind, EventPayload, SyncTask, TaskErrorKind, TaskResult};

/// container -> id -> entity
pub(crate) type Containers = HashMap<String, HashMap<String, Value>>;

pub struct MemoryDatabase {
    data: RwLock<Containers>,
    events: Arc<EventDispatcher>,
    /// user id -> token. Empty disables authentication.
    tokens: HashMap<String, String>,
}

impl MemoryDatabase {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            events,
            tokens: HashMap::new(),
        }
    }

    /// Require a matching token for every request
    pub fn with_tokens(mut self, tokens: HashMap<String, String>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Number of entities stored in `container`
    pub fn count(&self, container: &str) -> usize {
        self.data.read().get(container).map_or(0, HashMap::len)
    }

    pub fn get(&self, container: &str, id: &str) -> Option<Value> {
        self.data.read().get(container)?.get(id).cloned()
    }

    fn authenticate(&self, request: &ExecuteRequest) -> Result<(), String> {
        if self.tokens.is_empty() {
            return Ok(());
        }
        let user = request
            .context
            .user_id
            .as_deref()
            .ok_or_else(|| "missing userId".to_string())?;
        match (self.tokens.get(user), request.context.token.as_deref()) {
            (Some(expected), Some(token)) if expected == token => Ok(()),
            _ => Err(format!("invalid token for user '{user}'")),
        }
    }

    fn subscribe_changes(&self, client_id: &str, task: &SyncTask) -> TaskResult {
        let Some(container) = task.get_str("container") else {
            return TaskResult::error(TaskErrorKind::InvalidTask, "missing field 'container'");
        };
        let kinds: Vec<ChangeKind> = match task.get("changes") {
            None => ChangeKind::ALL.to_vec(),
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(kinds) => kinds,
                Err(e) => {
                    return TaskResult::error(
                        TaskErrorKind::InvalidTask,
                        format!("invalid 'changes': {e}"),
                    )
                }
            },
        };
        self.events.subscribe_changes(client_id, container, &kinds);
        TaskResult::ok()
    }

    fn subscribe_message(&self, client_id: &str, task: &SyncTask) -> TaskResult {
        let Some(name) = task.get_str("name") else {
            return TaskResult::error(TaskErrorKind::InvalidTask, "missing field 'name'");
        };
        let remove = task.get("remove").and_then(Value::as_bool).unwrap_or(false);
        self.events.subscribe_message(client_id, name, !remove);
        TaskResult::ok()
    }
}

fn message(task: &SyncTask) -> (TaskResult, Option<EventPayload>) {
    let Some(name) = task.get_str("name") else {
        return (
            TaskResult::error(TaskErrorKind::InvalidTask, "missing field 'name'"),
            None,
        );
    };
    let param = task.get("param").cloned().unwrap_or(Value::Null);
    (
        TaskResult::ok(),
        Some(EventPayload::Message {
            name: name.to_string(),
            param,
        }),
    )
}

impl SyncHandler for MemoryDatabase {
    fn handle(&self, request: &ExecuteRequest) -> SyncResult {
        if let Err(auth_error) = self.authenticate(request) {
            warn!(
                client_id = request.context.client_id.as_str(),
                "authentication failed: {}", auth_error
            );
            let results = request
                .tasks
                .iter()
                .map(|_| TaskResult::error(TaskErrorKind::PermissionDenied, auth_error.as_str()))
                .collect();
            return SyncResult {
                results,
                auth_error: Some(auth_error),
            };
        }

        let client_id = request.context.client_id.as_str();
        let mut changes = Vec::new();
        let mut results = Vec::with_capacity(request.tasks.len());
        {
            let mut data = self.data.write();
            for task in &request.tasks {
                let (result, change) = match task.task.as_str() {
                    "create" => crud::create(&mut data, task),
                    "upsert" => crud::upsert(&mut data, task),
                    "delete" => crud::delete(&mut data, task),
                    "merge" => crud::merge(&mut data, task),
                    "read" => (crud::read(&data, task), None),
                    "message" => message(task),
                    "subscribeChanges" => (self.subscribe_changes(client_id, task), None),
                    "subscribeMessage" => (self.subscribe_message(client_id, task), None),
                    other => (
                        TaskResult::error(
                            TaskErrorKind::InvalidTask,
                            format!("unknown task '{other}'"),
                        ),
                        None,
                    ),
                };
                results.push(result);
                changes.extend(change);
            }

            // seqs are assigned under the write lock so subscribers see
            // changes in commit order
            if !changes.is_empty() {
                let delivered = self
                    .events
                    .publish(request.context.user_id.as_deref(), &changes);
                debug!(client_id, changes = changes.len(), delivered, "changes published");
            }
        }

        SyncResult {
            results,
            auth_error: None,
        }
    }
}

/// Convenience for building a `subscribeChanges` task
pub fn subscribe_changes_task(container: &str, kinds: &[ChangeKind]) -> SyncTask {
    SyncTask::new(
        "subscribeChanges",
        json!({ "container": container, "changes": kinds }),
    )
}
