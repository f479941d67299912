//! # Reactive State Container
//!
//! Local application state for one resource kind, keyed by resource id.
//! [`StateSync`](crate::offline::StateSync) is the only writer; the UI reads
//! snapshots and reacts to the [`StateChange`] feed.
//!
//! ## Usage
//!
//! ```rust
//! use schedsync::state::{MemoryStateContainer, StateContainer};
//! use schedsync::shared::ResourceKind;
//!
//! # async fn example() {
//! let calendar = MemoryStateContainer::new(ResourceKind::Calendar);
//! let mut changes = calendar.subscribe();
//!
//! calendar.set("s1", serde_json::json!({"title": "Standup"})).await;
//! let change = changes.recv().await.unwrap();
//! assert_eq!(change.resource_id, "s1");
//! # }
//! ```

use crate::shared::event::ResourceKind;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Change feed capacity; slow subscribers see `Lagged` and should resync
/// from a snapshot
const CHANGE_FEED_CAPACITY: usize = 256;

/// Per-kind resource state
#[async_trait]
pub trait StateContainer: Send + Sync {
    /// Current value of a resource
    async fn get(&self, id: &str) -> Option<Value>;

    /// Replace a resource's value
    async fn set(&self, id: &str, value: Value);

    /// Drop a resource, returning its last value
    async fn remove(&self, id: &str) -> Option<Value>;

    /// Every resource currently held
    async fn snapshot(&self) -> HashMap<String, Value>;
}

/// One state mutation, as seen by subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub kind: ResourceKind,
    pub resource_id: String,
    /// New value, `None` when the resource was removed
    pub value: Option<Value>,
}

/// In-memory container with a broadcast change feed
#[derive(Debug)]
pub struct MemoryStateContainer {
    kind: ResourceKind,
    entries: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<StateChange>,
}

impl MemoryStateContainer {
    pub fn new(kind: ResourceKind) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Resource kind held by this container
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn notify(&self, resource_id: &str, value: Option<Value>) {
        // No subscribers is fine
        let _ = self.changes.send(StateChange {
            kind: self.kind.clone(),
            resource_id: resource_id.to_string(),
            value,
        });
    }
}

#[async_trait]
impl StateContainer for MemoryStateContainer {
    async fn get(&self, id: &str) -> Option<Value> {
        self.entries.read().await.get(id).cloned()
    }

    async fn set(&self, id: &str, value: Value) {
        self.entries
            .write()
            .await
            .insert(id.to_string(), value.clone());
        self.notify(id, Some(value));
    }

    async fn remove(&self, id: &str) -> Option<Value> {
        let removed = self.entries.write().await.remove(id);
        if removed.is_some() {
            self.notify(id, None);
        }
        removed
    }

    async fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.read().await.clone()
    }
}
