//! # Optimistic State Sync
//!
//! Applies local mutations to application state before the server confirms
//! them, and reconciles local state with what the server says afterwards.
//!
//! ## Features
//!
//! - **Immediate Updates**: Local state changes the moment a mutation is made
//! - **Rollback Support**: Restore the pre-update snapshot on timeout or failure
//! - **Confirmation**: A matching server echo discards tracking without a write
//! - **Adjustment**: A differing server echo overwrites local state
//! - **Single Pending Update**: A second mutation on a resource supersedes the first
//!
//! `StateSync` is the only writer of the [`StateContainer`]s it is built with.
//!
//! Update payloads carry the whole resource. Applying one, local or remote,
//! replaces the stored value; fields missing from the payload are gone
//! afterwards.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use schedsync::offline::StateSync;
//! use schedsync::shared::{ResourceKind, UpdateAction, UpdatePayload};
//! use schedsync::state::MemoryStateContainer;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> schedsync::shared::Result<()> {
//! let sync = StateSync::builder()
//!     .container(ResourceKind::Calendar, Arc::new(MemoryStateContainer::new(ResourceKind::Calendar)))
//!     .rollback_timeout(Duration::from_secs(30))
//!     .build();
//!
//! let payload = UpdatePayload::new("s1", UpdateAction::Create, serde_json::json!({"title": "X"}));
//! sync.apply_optimistic_update(&ResourceKind::Calendar, &payload).await?;
//!
//! // Server echo with the same data confirms without touching state
//! sync.handle_incoming_update(&ResourceKind::Calendar, &payload).await?;
//! # Ok(())
//! # }
//! ```

use crate::shared::config::DEFAULT_ROLLBACK_TIMEOUT;
use crate::shared::error::{Result, SyncError};
use crate::shared::event::{ConflictEvent, ResourceKind, UpdateAction, UpdatePayload};
use crate::state::{MemoryStateContainer, StateContainer};
use crate::sync::ConflictResolution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

type ResourceKey = (ResourceKind, String);

/// A speculatively applied local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticUpdate {
    pub id: Uuid,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub action: UpdateAction,
    /// When the mutation was applied locally
    pub timestamp: DateTime<Utc>,
    /// Last server-confirmed state; `None` if the resource did not exist
    pub original_snapshot: Option<Value>,
    /// State written optimistically; `None` for deletes
    pub proposed_snapshot: Option<Value>,
}

/// Why an optimistic update was rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// No server response within the rollback timeout
    Timeout,
    /// Immediate send failed
    SendFailed,
    /// Queued delivery failed permanently
    DeliveryFailed,
    /// Requested by the application
    Explicit,
}

/// What `handle_incoming_update` did with a server update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Matched the pending update; local state untouched
    Confirmed,
    /// Differed from the pending update; local state overwritten
    Adjusted,
    /// No pending update; applied as a remote mutation
    Applied,
    /// Older than the known version; dropped
    Ignored,
}

/// Notifications about local state reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum StateSyncEvent {
    Confirmed {
        kind: ResourceKind,
        resource_id: String,
    },
    Adjusted {
        kind: ResourceKind,
        resource_id: String,
    },
    RolledBack {
        kind: ResourceKind,
        resource_id: String,
        reason: RollbackReason,
    },
    Applied {
        kind: ResourceKind,
        resource_id: String,
    },
    Resolved {
        kind: ResourceKind,
        resource_id: String,
        version: u64,
    },
}

struct PendingEntry {
    update: OptimisticUpdate,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct StateSyncInner {
    pending: HashMap<ResourceKey, PendingEntry>,
    versions: HashMap<ResourceKey, u64>,
}

/// Builder for [`StateSync`]
#[derive(Default)]
pub struct StateSyncBuilder {
    containers: HashMap<ResourceKind, Arc<dyn StateContainer>>,
    rollback_timeout: Option<Duration>,
}

impl StateSyncBuilder {
    /// Register the state container for a resource kind
    pub fn container(mut self, kind: ResourceKind, container: Arc<dyn StateContainer>) -> Self {
        self.containers.insert(kind, container);
        self
    }

    pub fn rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Arc<StateSync> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let rollback_timeout = self.rollback_timeout.unwrap_or(DEFAULT_ROLLBACK_TIMEOUT);
        Arc::new_cyclic(|weak| StateSync {
            containers: self.containers,
            rollback_timeout,
            inner: Mutex::new(StateSyncInner::default()),
            events,
            self_ref: weak.clone(),
        })
    }
}

/// Optimistic update manager
pub struct StateSync {
    containers: HashMap<ResourceKind, Arc<dyn StateContainer>>,
    rollback_timeout: Duration,
    inner: Mutex<StateSyncInner>,
    events: broadcast::Sender<StateSyncEvent>,
    self_ref: Weak<StateSync>,
}

impl fmt::Debug for StateSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSync")
            .field("kinds", &self.containers.keys().collect::<Vec<_>>())
            .field("rollback_timeout", &self.rollback_timeout)
            .finish()
    }
}

impl StateSync {
    pub fn builder() -> StateSyncBuilder {
        StateSyncBuilder::default()
    }

    /// Calendar and project kinds backed by in-memory containers
    pub fn in_memory(rollback_timeout: Duration) -> Arc<Self> {
        Self::builder()
            .container(
                ResourceKind::Calendar,
                Arc::new(MemoryStateContainer::new(ResourceKind::Calendar)),
            )
            .container(
                ResourceKind::Project,
                Arc::new(MemoryStateContainer::new(ResourceKind::Project)),
            )
            .rollback_timeout(rollback_timeout)
            .build()
    }

    /// Container for a resource kind
    pub fn container(&self, kind: &ResourceKind) -> Option<Arc<dyn StateContainer>> {
        self.containers.get(kind).cloned()
    }

    /// Current local value of a resource
    pub async fn get_state(&self, kind: &ResourceKind, resource_id: &str) -> Option<Value> {
        match self.containers.get(kind) {
            Some(container) => container.get(resource_id).await,
            None => None,
        }
    }

    /// Subscribe to reconciliation events
    pub fn subscribe(&self) -> broadcast::Receiver<StateSyncEvent> {
        self.events.subscribe()
    }

    /// Apply a local mutation immediately and start its rollback timer.
    ///
    /// `payload.data` becomes the stored value as is; it is never merged
    /// into what was there.
    ///
    /// A pending update on the same resource is superseded: its timer is
    /// cancelled and its original snapshot carried over, so a rollback
    /// still restores the last server-confirmed state.
    pub async fn apply_optimistic_update(
        &self,
        kind: &ResourceKind,
        payload: &UpdatePayload,
    ) -> Result<OptimisticUpdate> {
        let container = self.require_container(kind)?;
        let key = (kind.clone(), payload.resource_id.clone());
        let mut inner = self.inner.lock().await;

        let original_snapshot = match inner.pending.remove(&key) {
            Some(mut previous) => {
                if let Some(timer) = previous.timer.take() {
                    timer.abort();
                }
                tracing::debug!(
                    "[StateSync] {} {} superseded pending update {}",
                    kind,
                    payload.resource_id,
                    previous.update.id
                );
                previous.update.original_snapshot
            }
            None => container.get(&payload.resource_id).await,
        };

        let proposed_snapshot = match payload.action {
            UpdateAction::Delete => None,
            UpdateAction::Create | UpdateAction::Update => Some(payload.data.clone()),
        };
        write(container.as_ref(), &payload.resource_id, proposed_snapshot.clone()).await;

        let update = OptimisticUpdate {
            id: Uuid::new_v4(),
            resource_kind: kind.clone(),
            resource_id: payload.resource_id.clone(),
            action: payload.action,
            timestamp: Utc::now(),
            original_snapshot,
            proposed_snapshot,
        };
        let timer = self.arm_timer(key.clone(), update.id);
        inner.pending.insert(
            key,
            PendingEntry {
                update: update.clone(),
                timer: Some(timer),
            },
        );

        tracing::debug!(
            "[StateSync] Applied optimistic {} on {} {}",
            payload.action.as_str(),
            kind,
            payload.resource_id
        );
        Ok(update)
    }

    /// Reconcile a server update with local state
    pub async fn handle_incoming_update(
        &self,
        kind: &ResourceKind,
        payload: &UpdatePayload,
    ) -> Result<IncomingOutcome> {
        let container = self.require_container(kind)?;
        let key = (kind.clone(), payload.resource_id.clone());
        let mut inner = self.inner.lock().await;

        let known = inner.versions.get(&key).copied().unwrap_or(0);
        if payload.version < known {
            tracing::debug!(
                "[StateSync] Ignoring stale {} {} (version {} < {})",
                kind,
                payload.resource_id,
                payload.version,
                known
            );
            return Ok(IncomingOutcome::Ignored);
        }
        inner.versions.insert(key.clone(), payload.version);

        let server_snapshot = match payload.action {
            UpdateAction::Delete => None,
            UpdateAction::Create | UpdateAction::Update => Some(payload.data.clone()),
        };

        let outcome = match inner.pending.remove(&key) {
            Some(mut pending) => {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                if pending.update.proposed_snapshot == server_snapshot {
                    IncomingOutcome::Confirmed
                } else {
                    write(container.as_ref(), &payload.resource_id, server_snapshot).await;
                    IncomingOutcome::Adjusted
                }
            }
            None => {
                if container.get(&payload.resource_id).await != server_snapshot {
                    write(container.as_ref(), &payload.resource_id, server_snapshot).await;
                }
                IncomingOutcome::Applied
            }
        };
        drop(inner);

        let resource_id = payload.resource_id.clone();
        let kind = kind.clone();
        match outcome {
            IncomingOutcome::Confirmed => {
                tracing::debug!("[StateSync] Confirmed {} {}", kind, resource_id);
                self.notify(StateSyncEvent::Confirmed { kind, resource_id });
            }
            IncomingOutcome::Adjusted => {
                tracing::info!("[StateSync] Server adjusted {} {}", kind, resource_id);
                self.notify(StateSyncEvent::Adjusted { kind, resource_id });
            }
            IncomingOutcome::Applied => {
                self.notify(StateSyncEvent::Applied { kind, resource_id });
            }
            IncomingOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Restore the pre-update snapshot and stop tracking.
    ///
    /// Returns `false` when nothing was pending for the resource.
    pub async fn rollback_optimistic_update(
        &self,
        kind: &ResourceKind,
        resource_id: &str,
    ) -> Result<bool> {
        self.rollback_with_reason(kind, resource_id, RollbackReason::Explicit)
            .await
    }

    /// Roll back with an explicit reason
    pub async fn rollback_with_reason(
        &self,
        kind: &ResourceKind,
        resource_id: &str,
        reason: RollbackReason,
    ) -> Result<bool> {
        let container = self.require_container(kind)?;
        let key = (kind.clone(), resource_id.to_string());
        let mut inner = self.inner.lock().await;

        let Some(mut pending) = inner.pending.remove(&key) else {
            return Ok(false);
        };
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        write(container.as_ref(), resource_id, pending.update.original_snapshot).await;
        drop(inner);

        tracing::warn!(
            "[StateSync] Rolled back {} {} ({:?})",
            kind,
            resource_id,
            reason
        );
        self.notify(StateSyncEvent::RolledBack {
            kind: kind.clone(),
            resource_id: resource_id.to_string(),
            reason,
        });
        Ok(true)
    }

    /// Write a conflict resolution into local state.
    ///
    /// The base is the last server-confirmed state (the pending update's
    /// original snapshot when one exists); `merged_data` is laid over it, or
    /// the server's changes when the server state stands. Resolutions that
    /// need a refetch are left to [`apply_snapshot`](Self::apply_snapshot)
    /// and return `false`.
    pub async fn apply_conflict_resolution(
        &self,
        event: &ConflictEvent,
        resolution: &ConflictResolution,
    ) -> Result<bool> {
        if resolution.needs_refetch {
            return Ok(false);
        }
        let container = self.require_container(&event.resource_kind)?;
        let key = (event.resource_kind.clone(), event.resource_id.clone());
        let mut inner = self.inner.lock().await;

        let base = match inner.pending.remove(&key) {
            Some(mut pending) => {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                pending.update.original_snapshot
            }
            None => container.get(&event.resource_id).await,
        };

        let mut merged = match base {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let overlay = resolution
            .merged_data
            .as_ref()
            .unwrap_or(&event.server_changes);
        for (field, value) in overlay {
            merged.insert(field.clone(), value.clone());
        }

        container.set(&event.resource_id, Value::Object(merged)).await;
        let version = inner.versions.entry(key).or_insert(0);
        *version = (*version).max(resolution.resulting_version);
        let version = *version;
        drop(inner);

        self.notify(StateSyncEvent::Resolved {
            kind: event.resource_kind.clone(),
            resource_id: event.resource_id.clone(),
            version,
        });
        Ok(true)
    }

    /// Overwrite local state with authoritative server state.
    ///
    /// `data` of `null` means the resource no longer exists. Any pending
    /// update on the resource is dropped without rollback.
    pub async fn apply_snapshot(
        &self,
        kind: &ResourceKind,
        resource_id: &str,
        data: Value,
        version: u64,
    ) -> Result<IncomingOutcome> {
        let container = self.require_container(kind)?;
        let key = (kind.clone(), resource_id.to_string());
        let mut inner = self.inner.lock().await;

        let known = inner.versions.get(&key).copied().unwrap_or(0);
        if version < known {
            return Ok(IncomingOutcome::Ignored);
        }
        if let Some(mut pending) = inner.pending.remove(&key) {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
        inner.versions.insert(key, version);

        let snapshot = if data.is_null() { None } else { Some(data) };
        write(container.as_ref(), resource_id, snapshot).await;
        drop(inner);

        tracing::debug!("[StateSync] Snapshot {} {} at version {}", kind, resource_id, version);
        self.notify(StateSyncEvent::Applied {
            kind: kind.clone(),
            resource_id: resource_id.to_string(),
        });
        Ok(IncomingOutcome::Applied)
    }

    /// Pause the rollback timer of a pending update (it waits in the
    /// offline queue rather than on the server)
    pub async fn defer_rollback(&self, kind: &ResourceKind, resource_id: &str) -> bool {
        let key = (kind.clone(), resource_id.to_string());
        let mut inner = self.inner.lock().await;
        match inner.pending.get_mut(&key) {
            Some(pending) => {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Restart the rollback timer of a pending update once it has been sent
    pub async fn arm_rollback(&self, kind: &ResourceKind, resource_id: &str) -> bool {
        let key = (kind.clone(), resource_id.to_string());
        let mut inner = self.inner.lock().await;
        let Some(update_id) = inner.pending.get(&key).map(|pending| pending.update.id) else {
            return false;
        };
        let timer = self.arm_timer(key.clone(), update_id);
        if let Some(pending) = inner.pending.get_mut(&key) {
            if let Some(previous) = pending.timer.replace(timer) {
                previous.abort();
            }
        }
        true
    }

    /// Pending update for a resource, if any
    pub async fn pending_update(
        &self,
        kind: &ResourceKind,
        resource_id: &str,
    ) -> Option<OptimisticUpdate> {
        let key = (kind.clone(), resource_id.to_string());
        self.inner
            .lock()
            .await
            .pending
            .get(&key)
            .map(|pending| pending.update.clone())
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Last version the server reported for a resource
    pub async fn known_version(&self, kind: &ResourceKind, resource_id: &str) -> u64 {
        let key = (kind.clone(), resource_id.to_string());
        self.inner
            .lock()
            .await
            .versions
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop every rollback timer; pending updates stay tracked
    pub async fn cancel_timers(&self) {
        let mut inner = self.inner.lock().await;
        for pending in inner.pending.values_mut() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
    }

    fn require_container(&self, kind: &ResourceKind) -> Result<Arc<dyn StateContainer>> {
        self.container(kind)
            .ok_or_else(|| SyncError::rejected(format!("no state container for '{}'", kind)))
    }

    fn arm_timer(&self, key: ResourceKey, update_id: Uuid) -> AbortHandle {
        let weak = self.self_ref.clone();
        let timeout = self.rollback_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(sync) = weak.upgrade() {
                sync.expire(key, update_id).await;
            }
        })
        .abort_handle()
    }

    /// Timer path: roll back only if the timed-out update is still the
    /// tracked one. The timer must not abort itself mid-rollback.
    async fn expire(&self, key: ResourceKey, update_id: Uuid) {
        let Some(container) = self.container(&key.0) else {
            return;
        };
        let mut inner = self.inner.lock().await;
        let is_current = inner
            .pending
            .get(&key)
            .map_or(false, |pending| pending.update.id == update_id);
        if !is_current {
            return;
        }
        let Some(pending) = inner.pending.remove(&key) else {
            return;
        };
        write(container.as_ref(), &key.1, pending.update.original_snapshot).await;
        drop(inner);

        tracing::warn!(
            "[StateSync] No server response for {} {} within {:?}, rolled back",
            key.0,
            key.1,
            self.rollback_timeout
        );
        self.notify(StateSyncEvent::RolledBack {
            kind: key.0,
            resource_id: key.1,
            reason: RollbackReason::Timeout,
        });
    }

    fn notify(&self, event: StateSyncEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for StateSync {
    fn drop(&mut self) {
        for pending in self.inner.get_mut().pending.values_mut() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
    }
}

async fn write(container: &dyn StateContainer, resource_id: &str, value: Option<Value>) {
    match value {
        Some(value) => container.set(resource_id, value).await,
        None => {
            container.remove(resource_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::event::ConflictKind;
    use crate::sync::ConflictResolver;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn calendar() -> ResourceKind {
        ResourceKind::Calendar
    }

    fn update(id: &str, data: Value) -> UpdatePayload {
        UpdatePayload::new(id, UpdateAction::Update, data)
    }

    async fn seeded(data: Value) -> (Arc<StateSync>, Arc<MemoryStateContainer>) {
        let container = Arc::new(MemoryStateContainer::new(calendar()));
        container.set("s1", data).await;
        let sync = StateSync::builder()
            .container(calendar(), container.clone())
            .rollback_timeout(TIMEOUT)
            .build();
        (sync, container)
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_replaces_the_whole_value() {
        let (sync, container) = seeded(json!({"title": "Old", "room": "A"})).await;
        let update = sync
            .apply_optimistic_update(&calendar(), &update("s1", json!({"title": "New"})))
            .await
            .unwrap();

        assert_eq!(container.get("s1").await, Some(json!({"title": "New"})));
        assert_eq!(update.original_snapshot, Some(json!({"title": "Old", "room": "A"})));

        sync.rollback_optimistic_update(&calendar(), "s1").await.unwrap();
        assert_eq!(container.get("s1").await, Some(json!({"title": "Old", "room": "A"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_confirms_without_write() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        let payload = update("s1", json!({"title": "New"}));
        sync.apply_optimistic_update(&calendar(), &payload).await.unwrap();

        let mut changes = container.subscribe();
        let outcome = sync
            .handle_incoming_update(&calendar(), &payload.clone().with_version(2))
            .await
            .unwrap();

        assert_eq!(outcome, IncomingOutcome::Confirmed);
        assert_eq!(container.get("s1").await, Some(json!({"title": "New"})));
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(sync.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_differing_echo_adjusts() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        sync.apply_optimistic_update(&calendar(), &update("s1", json!({"title": "New"})))
            .await
            .unwrap();

        let server = update("s1", json!({"title": "New", "color": "red"})).with_version(2);
        let outcome = sync.handle_incoming_update(&calendar(), &server).await.unwrap();

        assert_eq!(outcome, IncomingOutcome::Adjusted);
        assert_eq!(container.get("s1").await, Some(json!({"title": "New", "color": "red"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_restores_snapshot() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        let mut events = sync.subscribe();
        sync.apply_optimistic_update(&calendar(), &update("s1", json!({"title": "New"})))
            .await
            .unwrap();

        tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;

        assert_eq!(container.get("s1").await, Some(json!({"title": "Old"})));
        assert_eq!(sync.pending_count().await, 0);
        assert_eq!(
            events.recv().await.unwrap(),
            StateSyncEvent::RolledBack {
                kind: calendar(),
                resource_id: "s1".into(),
                reason: RollbackReason::Timeout
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_keeps_original_and_restarts_timer() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        let first = sync
            .apply_optimistic_update(&calendar(), &update("s1", json!({"title": "A"})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        let second = sync
            .apply_optimistic_update(&calendar(), &update("s1", json!({"title": "B"})))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.original_snapshot, Some(json!({"title": "Old"})));
        assert_eq!(sync.pending_count().await, 1);

        // The first timer would have fired here
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(container.get("s1").await, Some(json!({"title": "B"})));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(container.get("s1").await, Some(json!({"title": "Old"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_of_create_removes_resource() {
        let container = Arc::new(MemoryStateContainer::new(calendar()));
        let sync = StateSync::builder().container(calendar(), container.clone()).build();
        let payload = UpdatePayload::new("s9", UpdateAction::Create, json!({"title": "X"}));

        sync.apply_optimistic_update(&calendar(), &payload).await.unwrap();
        assert!(container.get("s9").await.is_some());

        assert!(sync.rollback_optimistic_update(&calendar(), "s9").await.unwrap());
        assert!(container.get("s9").await.is_none());
        assert!(!sync.rollback_optimistic_update(&calendar(), "s9").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_rollback_waits_until_armed() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        sync.apply_optimistic_update(&calendar(), &update("s1", json!({"title": "New"})))
            .await
            .unwrap();
        assert!(sync.defer_rollback(&calendar(), "s1").await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(container.get("s1").await, Some(json!({"title": "New"})));

        assert!(sync.arm_rollback(&calendar(), "s1").await);
        tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(container.get("s1").await, Some(json!({"title": "Old"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_updates_are_ignored() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        sync.handle_incoming_update(&calendar(), &update("s1", json!({"title": "v5"})).with_version(5))
            .await
            .unwrap();

        let outcome = sync
            .handle_incoming_update(&calendar(), &update("s1", json!({"title": "v3"})).with_version(3))
            .await
            .unwrap();

        assert_eq!(outcome, IncomingOutcome::Ignored);
        assert_eq!(container.get("s1").await, Some(json!({"title": "v5"})));
        assert_eq!(sync.known_version(&calendar(), "s1").await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_resolution_merges_over_confirmed_state() {
        let (sync, container) = seeded(json!({"title": "Old", "starts_at_utc": "2024-05-01T09:00:00Z"})).await;
        sync.apply_optimistic_update(
            &calendar(),
            &update("s1", json!({"title": "Old", "starts_at_utc": "2024-05-01T10:00:00Z"})),
        )
        .await
        .unwrap();

        let event = ConflictEvent {
            resource_kind: calendar(),
            resource_id: "s1".into(),
            conflict_kind: ConflictKind::ConcurrentEdit,
            local_version: 2,
            server_version: 3,
            local_changes: json!({"starts_at_utc": "2024-05-01T10:00:00Z"})
                .as_object()
                .cloned()
                .unwrap(),
            server_changes: json!({"starts_at_utc": "2024-05-01T11:00:00Z"})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let resolution = ConflictResolver::new().resolve_conflict(&event).unwrap().unwrap();

        assert!(sync.apply_conflict_resolution(&event, &resolution).await.unwrap());
        assert_eq!(
            container.get("s1").await,
            Some(json!({"title": "Old", "starts_at_utc": "2024-05-01T11:00:00Z"}))
        );
        assert_eq!(sync.known_version(&calendar(), "s1").await, 4);
        assert_eq!(sync.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_replaces_pending() {
        let (sync, container) = seeded(json!({"title": "Old"})).await;
        sync.apply_optimistic_update(&calendar(), &update("s1", json!({"title": "Mine"})))
            .await
            .unwrap();

        sync.apply_snapshot(&calendar(), "s1", json!({"title": "Server"}), 9)
            .await
            .unwrap();

        assert_eq!(container.get("s1").await, Some(json!({"title": "Server"})));
        assert!(sync.pending_update(&calendar(), "s1").await.is_none());

        sync.apply_snapshot(&calendar(), "s1", Value::Null, 10).await.unwrap();
        assert!(container.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let sync = StateSync::in_memory(TIMEOUT);
        let result = sync
            .apply_optimistic_update(&ResourceKind::Custom("task".into()), &update("t1", json!({})))
            .await;
        assert!(matches!(result, Err(SyncError::Rejected { .. })));
    }
}
