//! Client-side event processing
//!
//! Applies pushed events to a local entity store in seq order and invokes the
//! registered handler once per applied event. Duplicates (`seq <= last`) are
//! dropped. An event that skips ahead is rejected without being applied; since
//! it is not acknowledged the hub keeps it, and the resend on the next request
//! redelivers the missing range in order.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::types::{entity_key, EventMessage, EventPayload};

/// When pushed events are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDelivery {
    /// On the task that received the event
    Immediate,
    /// When the application calls [`ClientEvents::process_pending`]
    Queued,
}

/// What applying one event changed in the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventChanges {
    pub creates: usize,
    pub upserts: usize,
    pub deletes: usize,
    pub merges: usize,
    pub messages: usize,
}

/// Callback invoked once per applied event. Must not call back into the
/// [`ClientEvents`] that invokes it.
pub type EventHandler = Box<dyn FnMut(&EventMessage, &EventChanges) + Send>;

/// Local copy of subscribed containers: container -> id -> entity
#[derive(Debug, Default)]
pub struct LocalStore {
    containers: HashMap<String, HashMap<String, Value>>,
}

impl LocalStore {
    pub fn get(&self, container: &str, id: &str) -> Option<&Value> {
        self.containers.get(container)?.get(id)
    }

    pub fn len(&self, container: &str) -> usize {
        self.containers.get(container).map_or(0, HashMap::len)
    }

    fn apply(&mut self, payload: &EventPayload, changes: &mut EventChanges) {
        match payload {
            EventPayload::Create {
                container,
                entities,
            } => {
                let map = self.containers.entry(container.clone()).or_default();
                for entity in entities {
                    if let Some(id) = entity_key(entity) {
                        map.insert(id, entity.clone());
                        changes.creates += 1;
                    }
                }
            }
            EventPayload::Upsert {
                container,
                entities,
            } => {
                let map = self.containers.entry(container.clone()).or_default();
                for entity in entities {
                    if let Some(id) = entity_key(entity) {
                        map.insert(id, entity.clone());
                        changes.upserts += 1;
                    }
                }
            }
            EventPayload::Delete { container, ids } => {
                if let Some(map) = self.containers.get_mut(container) {
                    for id in ids {
                        if map.remove(id).is_some() {
                            changes.deletes += 1;
                        }
                    }
                }
            }
            EventPayload::Merge { container, patches } => {
                let map = self.containers.entry(container.clone()).or_default();
                for patch in patches {
                    let Some(id) = entity_key(patch) else {
                        continue;
                    };
                    match map.get_mut(&id) {
                        Some(entity) => {
                            merge_patch(entity, patch);
                            changes.merges += 1;
                        }
                        None => debug!(
                            container = container.as_str(),
                            id = id.as_str(),
                            "merge for unknown entity"
                        ),
                    }
                }
            }
            EventPayload::Message { .. } => changes.messages += 1,
        }
    }
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Duplicate,
    Gap,
}

struct ApplyState {
    last_seq: i64,
    store: LocalStore,
    handler: Option<EventHandler>,
    applied: u64,
    duplicates: u64,
    gaps: u64,
}

impl ApplyState {
    fn apply(&mut self, event: &EventMessage) -> Outcome {
        if event.seq <= self.last_seq {
            self.duplicates += 1;
            debug!(seq = event.seq, last = self.last_seq, "duplicate event dropped");
            return Outcome::Duplicate;
        }
        if event.seq > self.last_seq + 1 {
            self.gaps += 1;
            warn!(
                seq = event.seq,
                expected = self.last_seq + 1,
                "event out of sequence, waiting for resend"
            );
            return Outcome::Gap;
        }

        let mut changes = EventChanges::default();
        for payload in &event.payload {
            self.store.apply(payload, &mut changes);
        }
        self.last_seq = event.seq;
        self.applied += 1;
        if let Some(handler) = self.handler.as_mut() {
            handler(event, &changes);
        }
        Outcome::Applied
    }
}

/// Counters exposed by [`ClientEvents::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientEventStats {
    pub last_seq: i64,
    pub applied: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub pending: usize,
}

/// Event state of one logical client. Share it (`Arc`) across reconnects so
/// the seq continues on the new connection.
pub struct ClientEvents {
    delivery: EventDelivery,
    state: Mutex<ApplyState>,
    pending: Mutex<VecDeque<EventMessage>>,
}

impl ClientEvents {
    pub fn new(delivery: EventDelivery) -> Self {
        Self {
            delivery,
            state: Mutex::new(ApplyState {
                last_seq: 0,
                store: LocalStore::default(),
                handler: None,
                applied: 0,
                duplicates: 0,
                gaps: 0,
            }),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn delivery(&self) -> EventDelivery {
        self.delivery
    }

    /// Register the event handler, replacing any previous one
    pub fn set_handler(&self, handler: impl FnMut(&EventMessage, &EventChanges) + Send + 'static) {
        self.state.lock().handler = Some(Box::new(handler));
    }

    /// Highest applied seq, sent as `eventAck`
    pub fn last_seq(&self) -> i64 {
        self.state.lock().last_seq
    }

    /// Hand over an event received from the hub
    pub fn on_event(&self, event: EventMessage) {
        match self.delivery {
            EventDelivery::Immediate => {
                self.state.lock().apply(&event);
            }
            EventDelivery::Queued => self.pending.lock().push_back(event),
        }
    }

    /// Apply every queued event. Returns how many were applied.
    pub fn process_pending(&self) -> usize {
        let events: Vec<EventMessage> = self.pending.lock().drain(..).collect();
        if events.is_empty() {
            return 0;
        }
        let mut state = self.state.lock();
        events
            .iter()
            .filter(|event| state.apply(event) == Outcome::Applied)
            .count()
    }

    /// Read the local store
    pub fn with_store<R>(&self, f: impl FnOnce(&LocalStore) -> R) -> R {
        f(&self.state.lock().store)
    }

    pub fn stats(&self) -> ClientEventStats {
        let pending = self.pending.lock().len();
        let state = self.state.lock();
        ClientEventStats {
            last_seq: state.last_seq,
            applied: state.applied,
            duplicates: state.duplicates,
            gaps: state.gaps,
            pending,
        }
    }
}
