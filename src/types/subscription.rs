//! Per-client subscription filter

use std::collections::{HashMap, HashSet};

use super::event::{ChangeKind, EventPayload};

/// Which container changes and messages a client wants to receive
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    changes: HashMap<String, HashSet<ChangeKind>>,
    messages: HashSet<String>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.messages.is_empty()
    }

    /// Replace the change kinds watched on a container.
    /// An empty slice removes the container subscription.
    pub fn set_changes(&mut self, container: &str, kinds: &[ChangeKind]) {
        if kinds.is_empty() {
            self.changes.remove(container);
        } else {
            self.changes
                .insert(container.to_string(), kinds.iter().copied().collect());
        }
    }

    /// Subscribe to a message name. A trailing `*` matches any suffix.
    pub fn add_message(&mut self, name: &str) {
        self.messages.insert(name.to_string());
    }

    pub fn remove_message(&mut self, name: &str) {
        self.messages.remove(name);
    }

    /// Check whether a payload passes this filter
    pub fn matches(&self, payload: &EventPayload) -> bool {
        match payload {
            EventPayload::Message { name, .. } => self.matches_message(name),
            _ => {
                let (Some(container), Some(kind)) = (payload.container(), payload.change_kind())
                else {
                    return false;
                };
                self.changes
                    .get(container)
                    .is_some_and(|kinds| kinds.contains(&kind))
            }
        }
    }

    fn matches_message(&self, name: &str) -> bool {
        self.messages.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => pattern == name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn upsert(container: &str) -> EventPayload {
        EventPayload::Upsert {
            container: container.to_string(),
            entities: vec![],
        }
    }

    fn message(name: &str) -> EventPayload {
        EventPayload::Message {
            name: name.to_string(),
            param: Value::Null,
        }
    }

    #[test]
    fn test_container_filter() {
        let mut sub = Subscription::new();
        sub.set_changes("articles", &[ChangeKind::Upsert]);

        assert!(sub.matches(&upsert("articles")));
        assert!(!sub.matches(&upsert("users")));
        assert!(!sub.matches(&EventPayload::Delete {
            container: "articles".to_string(),
            ids: vec![],
        }));

        sub.set_changes("articles", &[]);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_message_wildcard() {
        let mut sub = Subscription::new();
        sub.add_message("chat.*");
        sub.add_message("ping");

        assert!(sub.matches(&message("chat.room1")));
        assert!(sub.matches(&message("ping")));
        assert!(!sub.matches(&message("pong")));

        sub.remove_message("chat.*");
        assert!(!sub.matches(&message("chat.room1")));
    }
}
