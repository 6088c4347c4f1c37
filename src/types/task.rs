//! Task and task result types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single task inside a sync request.
///
/// The hub does not interpret tasks. `task` names the operation and the
/// remaining fields are handed to the executor as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub task: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl SyncTask {
    /// Create a task from its name and a JSON object body
    pub fn new(task: &str, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            task: task.to_string(),
            body,
        }
    }

    /// Get a body field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Get a string body field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(|v| v.as_str())
    }
}

/// Result of one task, positionally matching its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TaskResult {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Error {
        error: TaskError,
    },
}

impl TaskResult {
    pub fn ok() -> Self {
        TaskResult::Ok { value: None }
    }

    pub fn with_value(value: Value) -> Self {
        TaskResult::Ok { value: Some(value) }
    }

    pub fn error(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        TaskResult::Error {
            error: TaskError {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TaskResult::Ok { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskResult::Ok { value } => value.as_ref(),
            TaskResult::Error { .. } => None,
        }
    }
}

/// Task level failure embedded in a [`TaskResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    InvalidTask,
    NotFound,
    WriteError,
    PermissionDenied,
}
