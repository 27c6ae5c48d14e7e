//! Core event types for the a3s-observe system
//!
//! Event types are interned through an explicit [`EventTypeRegistry`] owned
//! by the application; two requests for the same name always yield the same
//! [`EventTypeId`].

use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

/// Interned event type identifier
///
/// Cheap to clone. Equality and hashing are by identity of the interned
/// allocation, so two ids compare equal only when they came from the same
/// registry entry.
#[derive(Clone)]
pub struct EventTypeId {
    name: Arc<str>,
}

impl EventTypeId {
    /// The name this identifier was interned from
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for EventTypeId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.name, &other.name)
    }
}

impl Eq for EventTypeId {}

impl Hash for EventTypeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.name) as *const u8).hash(state);
    }
}

impl fmt::Debug for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventTypeId").field(&self.name()).finish()
    }
}

impl fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for EventTypeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Intern table for event type names
///
/// Cloning the registry shares the underlying table. Entries are created
/// once and live as long as any clone of the registry.
#[derive(Clone, Default)]
pub struct EventTypeRegistry {
    types: Arc<RwLock<HashMap<Arc<str>, EventTypeId>>>,
}

impl EventTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical identifier for `name`, interning it on first use
    pub fn intern(&self, name: &str) -> EventTypeId {
        if let Some(id) = self.get(name) {
            return id;
        }

        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        // Another writer may have interned the name between the two locks.
        if let Some(id) = types.get(name) {
            return id.clone();
        }

        let key: Arc<str> = Arc::from(name);
        let id = EventTypeId { name: key.clone() };
        types.insert(key, id.clone());
        tracing::debug!(event_type = %name, "Event type interned");
        id
    }

    /// Look up an already interned name without creating it
    pub fn get(&self, name: &str) -> Option<EventTypeId> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types.get(name).cloned()
    }

    /// Number of interned types
    pub fn len(&self) -> usize {
        self.types.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All interned names, sorted
    pub fn names(&self) -> Vec<String> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = types.keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }
}

/// A single event delivered to observers
///
/// Built once per trigger and shared immutably (as `Arc<Event>`) with every
/// observer in the dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Interned event type
    pub event_type: EventTypeId,

    /// Event payload — arbitrary JSON data
    pub payload: serde_json::Value,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Optional key-value metadata
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(event_type: EventTypeId, payload: serde_json::Value) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type,
            payload,
            timestamp: now_millis(),
            metadata: HashMap::new(),
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Current time in Unix milliseconds
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_intern_same_name_is_identical() {
        let registry = EventTypeRegistry::new();
        let a = registry.intern("order.created");
        let b = registry.intern("order.created");

        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_intern_different_names_differ() {
        let registry = EventTypeRegistry::new();
        let x = registry.intern("X");
        let y = registry.intern("Y");

        assert_ne!(x, y);
        assert_eq!(registry.names(), vec!["X", "Y"]);
    }

    #[test]
    fn test_ids_from_separate_registries_differ() {
        let first = EventTypeRegistry::new();
        let second = EventTypeRegistry::new();
        assert_ne!(first.intern("X"), second.intern("X"));
    }

    #[test]
    fn test_cloned_registry_shares_table() {
        let registry = EventTypeRegistry::new();
        let clone = registry.clone();
        let a = registry.intern("shared");
        assert_eq!(clone.get("shared"), Some(a));
        assert!(clone.get("missing").is_none());
    }

    #[test]
    fn test_ids_hash_by_identity() {
        let registry = EventTypeRegistry::new();
        let mut set = HashSet::new();
        set.insert(registry.intern("a"));
        set.insert(registry.intern("a"));
        set.insert(registry.intern("b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_concurrent_intern_yields_one_id() {
        let registry = EventTypeRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.intern("contended"))
            })
            .collect();

        let ids: Vec<EventTypeId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_event_creation() {
        let registry = EventTypeRegistry::new();
        let event = Event::new(registry.intern("deploy.completed"), serde_json::json!({"v": 2}))
            .with_metadata("env", "production");

        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.event_type.name(), "deploy.completed");
        assert!(event.timestamp > 0);
        assert_eq!(event.metadata["env"], "production");
    }

    #[test]
    fn test_event_serialization() {
        let registry = EventTypeRegistry::new();
        let event = Event::new(registry.intern("forex.rate_change"), serde_json::json!({"rate": 7.35}));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"forex.rate_change\""));
        assert!(json.contains("\"rate\":7.35"));
    }
}
