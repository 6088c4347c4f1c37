//! Container operations of the in-memory database

use serde_json::{json, Value};

use super::Containers;
use crate::event::merge_patch;
use crate::types::{entity_key, EventPayload, SyncTask, TaskErrorKind, TaskResult};

/// Outcome of one mutating task: its result and the change to publish
pub(crate) type Mutation = (TaskResult, Option<EventPayload>);

fn container_of(task: &SyncTask) -> Result<String, TaskResult> {
    task.get_str("container").map(str::to_string).ok_or_else(|| {
        TaskResult::error(TaskErrorKind::InvalidTask, "missing field 'container'")
    })
}

fn array_of<'a>(task: &'a SyncTask, field: &str) -> Result<&'a Vec<Value>, TaskResult> {
    task.get(field).and_then(Value::as_array).ok_or_else(|| {
        TaskResult::error(
            TaskErrorKind::InvalidTask,
            format!("missing array field '{field}'"),
        )
    })
}

/// Keys of every entity, failing on the first one without an id
fn keyed(entities: &[Value]) -> Result<Vec<(String, Value)>, TaskResult> {
    entities
        .iter()
        .map(|e| {
            entity_key(e).map(|id| (id, e.clone())).ok_or_else(|| {
                TaskResult::error(TaskErrorKind::InvalidTask, "entity without 'id'")
            })
        })
        .collect()
}

/// Insert new entities. Fails without writing if any id already exists.
pub(crate) fn create(data: &mut Containers, task: &SyncTask) -> Mutation {
    let prepared = container_of(task)
        .and_then(|c| Ok((c, keyed(array_of(task, "entities")?)?)));
    let (container, entities) = match prepared {
        Ok(p) => p,
        Err(result) => return (result, None),
    };

    let map = data.entry(container.clone()).or_default();
    if let Some((id, _)) = entities.iter().find(|(id, _)| map.contains_key(id)) {
        return (
            TaskResult::error(
                TaskErrorKind::WriteError,
                format!("entity '{id}' already exists in '{container}'"),
            ),
            None,
        );
    }

    let values: Vec<Value> = entities.iter().map(|(_, e)| e.clone()).collect();
    let count = entities.len();
    map.extend(entities);
    (
        TaskResult::with_value(json!({ "count": count })),
        Some(EventPayload::Create {
            container,
            entities: values,
        }),
    )
}

/// Insert or replace entities
pub(crate) fn upsert(data: &mut Containers, task: &SyncTask) -> Mutation {
    let prepared = container_of(task)
        .and_then(|c| Ok((c, keyed(array_of(task, "entities")?)?)));
    let (container, entities) = match prepared {
        Ok(p) => p,
        Err(result) => return (result, None),
    };

    let values: Vec<Value> = entities.iter().map(|(_, e)| e.clone()).collect();
    let count = entities.len();
    data.entry(container.clone()).or_default().extend(entities);
    (
        TaskResult::with_value(json!({ "count": count })),
        Some(EventPayload::Upsert {
            container,
            entities: values,
        }),
    )
}

/// Remove entities by id. Unknown ids are skipped.
pub(crate) fn delete(data: &mut Containers, task: &SyncTask) -> Mutation {
    let container = match container_of(task) {
        Ok(c) => c,
        Err(result) => return (result, None),
    };
    let ids: Vec<String> = match array_of(task, "ids") {
        Ok(ids) => ids
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Err(result) => return (result, None),
    };

    let removed: Vec<String> = match data.get_mut(&container) {
        Some(map) => ids.into_iter().filter(|id| map.remove(id).is_some()).collect(),
        None => Vec::new(),
    };
    if removed.is_empty() {
        return (TaskResult::with_value(json!({ "count": 0 })), None);
    }
    (
        TaskResult::with_value(json!({ "count": removed.len() })),
        Some(EventPayload::Delete {
            container,
            ids: removed,
        }),
    )
}

/// Apply JSON merge patches to existing entities
pub(crate) fn merge(data: &mut Containers, task: &SyncTask) -> Mutation {
    let prepared = container_of(task)
        .and_then(|c| Ok((c, keyed(array_of(task, "patches")?)?)));
    let (container, patches) = match prepared {
        Ok(p) => p,
        Err(result) => return (result, None),
    };

    let Some(map) = data.get_mut(&container) else {
        return (
            TaskResult::error(TaskErrorKind::NotFound, format!("container '{container}' is empty")),
            None,
        );
    };
    if let Some((id, _)) = patches.iter().find(|(id, _)| !map.contains_key(id)) {
        return (
            TaskResult::error(
                TaskErrorKind::NotFound,
                format!("entity '{id}' not found in '{container}'"),
            ),
            None,
        );
    }

    let mut applied = Vec::with_capacity(patches.len());
    for (id, patch) in patches {
        if let Some(entity) = map.get_mut(&id) {
            merge_patch(entity, &patch);
            applied.push(patch);
        }
    }
    (
        TaskResult::with_value(json!({ "count": applied.len() })),
        Some(EventPayload::Merge {
            container,
            patches: applied,
        }),
    )
}

/// Read entities by id, or the whole container when `ids` is absent
pub(crate) fn read(data: &Containers, task: &SyncTask) -> TaskResult {
    let container = match container_of(task) {
        Ok(c) => c,
        Err(result) => return result,
    };
    let Some(map) = data.get(&container) else {
        return TaskResult::with_value(json!([]));
    };

    let entities: Vec<Value> = match task.get("ids").and_then(Value::as_array) {
        Some(ids) => ids
            .iter()
            .filter_map(|id| match id {
                Value::String(s) => map.get(s).cloned(),
                Value::Number(n) => map.get(&n.to_string()).cloned(),
                _ => None,
            })
            .collect(),
        None => {
            let mut all: Vec<(&String, &Value)> = map.iter().collect();
            all.sort_by(|a, b| a.0.cmp(b.0));
            all.into_iter().map(|(_, v)| v.clone()).collect()
        }
    };
    TaskResult::with_value(Value::Array(entities))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, body: Value) -> SyncTask {
        SyncTask::new(name, body)
    }

    #[test]
    fn test_create_rejects_existing_id() {
        let mut data = Containers::new();
        let first = create(&mut data, &task("create", json!({
            "container": "articles",
            "entities": [{ "id": "a1" }]
        })));
        assert!(first.0.is_ok());
        assert!(first.1.is_some());

        let (result, event) = create(&mut data, &task("create", json!({
            "container": "articles",
            "entities": [{ "id": "a2" }, { "id": "a1" }]
        })));
        assert!(!result.is_ok());
        assert!(event.is_none());
        assert!(!data["articles"].contains_key("a2"));
    }

    #[test]
    fn test_upsert_requires_ids() {
        let mut data = Containers::new();
        let (result, _) = upsert(&mut data, &task("upsert", json!({
            "container": "articles",
            "entities": [{ "title": "no id" }]
        })));
        assert!(!result.is_ok());
    }

    #[test]
    fn test_delete_reports_only_removed_ids() {
        let mut data = Containers::new();
        upsert(&mut data, &task("upsert", json!({
            "container": "articles",
            "entities": [{ "id": "a1" }, { "id": 2 }]
        })));

        let (result, event) = delete(&mut data, &task("delete", json!({
            "container": "articles",
            "ids": ["a1", 2, "zz"]
        })));
        assert_eq!(result.value(), Some(&json!({ "count": 2 })));
        assert_eq!(
            event,
            Some(EventPayload::Delete {
                container: "articles".to_string(),
                ids: vec!["a1".to_string(), "2".to_string()],
            })
        );
    }

    #[test]
    fn test_merge_and_read() {
        let mut data = Containers::new();
        upsert(&mut data, &task("upsert", json!({
            "container": "articles",
            "entities": [{ "id": "a1", "title": "draft", "views": 1 }]
        })));

        let (result, _) = merge(&mut data, &task("merge", json!({
            "container": "articles",
            "patches": [{ "id": "a1", "title": "final", "views": null }]
        })));
        assert!(result.is_ok());

        let read = read(&data, &task("read", json!({ "container": "articles", "ids": ["a1"] })));
        assert_eq!(read.value(), Some(&json!([{ "id": "a1", "title": "final" }])));
    }

    #[test]
    fn test_merge_unknown_entity_is_not_found() {
        let mut data = Containers::new();
        upsert(&mut data, &task("upsert", json!({
            "container": "articles",
            "entities": [{ "id": "a1" }]
        })));
        let (result, event) = merge(&mut data, &task("merge", json!({
            "container": "articles",
            "patches": [{ "id": "missing" }]
        })));
        assert!(!result.is_ok());
        assert!(event.is_none());
    }
}
