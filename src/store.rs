/*!
 # Configuration and entity store boundary

 The controller reads its wake time, lead-in duration, and toggles from a
 host-side store whose values are human-editable. Every observed change is
 delivered to subscribers together with the value it replaced.
*/

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

/// A single observed change to a store entity.
#[derive(Debug, Clone)]
pub struct Change {
    /// Entity that changed
    pub entity: String,
    /// Value before the change, if any
    pub old: Option<String>,
    /// Value after the change
    pub new: String,
}

/// Host-platform store the controller reads its settings from.
pub trait ConfigStore: Send + Sync {
    /// Current value of an entity, if it has one.
    fn get(&self, entity: &str) -> Option<String>;

    /// Write a value, notifying subscribers of the change.
    fn set(&self, entity: &str, value: &str);

    /// Whether the entity is known to the host platform.
    fn entity_exists(&self, entity: &str) -> bool;

    /// Subscribe to changes of a single entity.
    fn subscribe(&self, entity: &str) -> mpsc::UnboundedReceiver<Change>;
}

/// In-process [`ConfigStore`] used by the binaries and tests.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    registry: RwLock<HashSet<String>>,
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Change>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an entity as existing without giving it a value. Light
    /// fixtures have no store-side value but must pass the registry check.
    pub fn register(&self, entity: &str) {
        self.registry.write().insert(entity.to_string());
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, entity: &str) -> Option<String> {
        self.values.read().get(entity).cloned()
    }

    fn set(&self, entity: &str, value: &str) {
        let old = self
            .values
            .write()
            .insert(entity.to_string(), value.to_string());
        trace!("store: {entity} = {value}");

        let change = Change {
            entity: entity.to_string(),
            old,
            new: value.to_string(),
        };
        let mut subscribers = self.subscribers.write();
        if let Some(senders) = subscribers.get_mut(entity) {
            // Drop subscribers whose receiver side has gone away
            senders.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }

    fn entity_exists(&self, entity: &str) -> bool {
        self.registry.read().contains(entity) || self.values.read().contains_key(entity)
    }

    fn subscribe(&self, entity: &str) -> mpsc::UnboundedReceiver<Change> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .entry(entity.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
