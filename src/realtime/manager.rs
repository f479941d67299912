//! # Realtime Manager
//!
//! The engine's public entry point. One explicitly constructed instance per
//! application session ties the connection, the offline queue, conflict
//! resolution and optimistic state together.
//!
//! ## Features
//!
//! - **Local Mutations**: Applied optimistically, then sent or queued
//! - **Acknowledged Delivery**: Sent updates stay in flight until `update:ack`
//! - **Automatic Drain**: The queue drains every time the connection comes up
//! - **Conflict Routing**: `conflict:detected` goes through the resolver first
//! - **Refetch**: Version mismatches fetch authoritative state and re-apply local edits
//! - **Observers**: Engine events via `broadcast` and registered callbacks
//!
//! ## Delivery
//!
//! Every update goes out tagged with an operation id: the queue item id for
//! drained items, a fresh id for direct sends. The operation stays in flight
//! until the server answers with `update:ack` or echoes the update back with
//! the same id; only then is a queue item removed. An `error` frame carrying
//! the id rejects the operation. When the connection drops, everything still
//! in flight goes back to the queue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use schedsync::realtime::{LoopbackTransport, RealtimeManager};
//! use schedsync::shared::{EngineConfig, UpdateAction};
//! use std::sync::Arc;
//!
//! # async fn example() -> schedsync::shared::Result<()> {
//! let (transport, _peer) = LoopbackTransport::pair();
//! let engine = RealtimeManager::ephemeral(EngineConfig::default(), Arc::new(transport));
//! engine.initialize().await?;
//! engine.subscribe_to_project("p1").await?;
//!
//! engine
//!     .send_calendar_update("s1", "p1", UpdateAction::Create, serde_json::json!({"title": "X"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::local_db::{MemoryQueueStore, QueueStore};
use crate::offline::{
    FailureOutcome, IncomingOutcome, RetryPolicy, RollbackReason, StateSync, SyncQueue,
};
use crate::offline::queue::QueueStats;
use crate::realtime::connection::{
    ConnectionEvent, ConnectionManager, ConnectionMetrics, ConnectionStatus,
};
use crate::realtime::transport::Transport;
use crate::shared::config::EngineConfig;
use crate::shared::error::{Result, SyncError};
use crate::shared::event::{
    calendar_room, project_room, ClientMessage, ConflictEvent, FetchPayload, ResourceKind,
    ServerMessage, SnapshotPayload, UpdateAction, UpdatePayload,
};
use crate::sync::{ConflictResolver, ResolutionStrategy, SyncMetrics};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Everything the engine reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StatusChanged {
        previous: ConnectionStatus,
        current: ConnectionStatus,
    },
    QueueUpdated(QueueStats),
    Error(String),
    /// A queued operation failed for good; its optimistic update was rolled back
    OperationFailed {
        item_id: String,
        resource_kind: ResourceKind,
        resource_id: String,
        error: String,
    },
    /// A server update was applied to local state
    ResourceChanged {
        resource_kind: ResourceKind,
        resource_id: String,
        outcome: IncomingOutcome,
    },
    ConflictResolved {
        resource_kind: ResourceKind,
        resource_id: String,
        strategy: ResolutionStrategy,
        version: u64,
    },
}

/// What happened to a local mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent over the live connection
    Sent,
    /// Persisted in the offline queue
    Queued { item_id: String },
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sent; each is removed from the queue once acknowledged
    pub delivered: u64,
    /// Failed but scheduled for another attempt
    pub retried: u64,
    /// Failed permanently
    pub failed: u64,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0 && self.retried == 0 && self.failed == 0
    }
}

/// Handle returned by callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
type QueueCallback = Arc<dyn Fn(&QueueStats) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    status: Vec<(ListenerId, StatusCallback)>,
    queue: Vec<(ListenerId, QueueCallback)>,
    error: Vec<(ListenerId, ErrorCallback)>,
}

impl Listeners {
    fn next(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    tasks: Vec<JoinHandle<()>>,
}

type ResourceKey = (ResourceKind, String);

/// Where an unacknowledged update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Drained from the queue; the operation id is the item id
    Queue,
    /// Sent directly for the optimistic update `update_id`
    Direct { update_id: Uuid },
}

#[derive(Debug, Clone)]
struct InFlight {
    seq: u64,
    kind: ResourceKind,
    /// Untagged payload, re-queued as is
    payload: UpdatePayload,
    origin: Origin,
}

/// Sent updates waiting for `update:ack`, keyed by operation id
#[derive(Debug, Default)]
struct InFlightTable {
    next_seq: u64,
    entries: HashMap<String, InFlight>,
}

/// Local changes to re-apply once authoritative state arrives
#[derive(Debug, Default)]
struct PendingRefetch {
    changes: Map<String, Value>,
    project_id: Option<String>,
}

/// Session-scoped sync engine
pub struct RealtimeManager {
    connection: ConnectionManager,
    queue: SyncQueue,
    state: Arc<StateSync>,
    resolver: ConflictResolver,
    audit: Arc<dyn AuditLogger>,
    events: broadcast::Sender<EngineEvent>,
    listeners: StdRwLock<Listeners>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes drains, direct sends and releasing in-flight updates
    delivery: Mutex<()>,
    in_flight: StdMutex<InFlightTable>,
    drain_metrics: Mutex<SyncMetrics>,
    retry_timer: StdMutex<Option<AbortHandle>>,
    refetches: Mutex<HashMap<ResourceKey, PendingRefetch>>,
    /// Owning project of calendar entries seen so far
    scopes: Mutex<HashMap<ResourceKey, String>>,
    self_ref: Weak<RealtimeManager>,
}

impl fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("connection", &self.connection)
            .field("queue", &self.queue)
            .field("state", &self.state)
            .finish()
    }
}

impl RealtimeManager {
    pub fn new(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn QueueStore>,
        state: Arc<StateSync>,
        audit: Arc<dyn AuditLogger>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            connection: ConnectionManager::from_config(transport, config),
            queue: SyncQueue::new(store, RetryPolicy::from(&config.queue)),
            state,
            resolver: ConflictResolver::new(),
            audit,
            events,
            listeners: StdRwLock::new(Listeners::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            delivery: Mutex::new(()),
            in_flight: StdMutex::new(InFlightTable::default()),
            drain_metrics: Mutex::new(SyncMetrics::new()),
            retry_timer: StdMutex::new(None),
            refetches: Mutex::new(HashMap::new()),
            scopes: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    /// In-memory queue and state, tracing audit log
    pub fn ephemeral(config: EngineConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::new(
            &config,
            transport,
            Arc::new(MemoryQueueStore::new()),
            StateSync::in_memory(config.rollback_timeout),
            Arc::new(TracingAuditLogger),
        )
    }

    /// Start the engine: recover the queue, start routing events and connect.
    ///
    /// Calling it again while running is a no-op. A connection failure is
    /// reported through status and error events, not returned.
    pub async fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.initialized {
            tracing::debug!("[Realtime] Already initialized");
            return Ok(());
        }

        self.queue.recover().await?;
        lifecycle.tasks.push(tokio::spawn(route_connection_events(
            self.self_ref.clone(),
            self.connection.attach(),
        )));
        lifecycle.tasks.push(tokio::spawn(forward_queue_stats(
            self.self_ref.clone(),
            self.queue.subscribe(),
        )));
        lifecycle.initialized = true;
        drop(lifecycle);

        tracing::info!("[Realtime] Initialized");
        if let Err(e) = self.connection.connect().await {
            tracing::error!("[Realtime] Initial connection failed: {}", e);
        }
        Ok(())
    }

    /// Stop everything. Queued items stay persisted for the next session.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.initialized {
            return;
        }
        for task in lifecycle.tasks.drain(..) {
            task.abort();
        }
        lifecycle.initialized = false;
        drop(lifecycle);

        if let Some(timer) = self.lock_retry_timer().take() {
            timer.abort();
        }
        self.release_in_flight().await;
        if let Err(e) = self.queue.flush().await {
            tracing::warn!("[Realtime] Queue flush failed during shutdown: {}", e);
        }

        let previous = self.connection.status().await;
        self.connection.disconnect().await;
        if previous != ConnectionStatus::Disconnected {
            self.dispatch(EngineEvent::StatusChanged {
                previous,
                current: ConnectionStatus::Disconnected,
            });
        }
        self.state.cancel_timers().await;
        tracing::info!("[Realtime] Shut down");
    }

    pub async fn is_initialized(&self) -> bool {
        self.lifecycle.lock().await.initialized
    }

    // ---- subscriptions ----

    pub async fn subscribe_to_project(&self, project_id: &str) -> Result<bool> {
        self.connection.join_room(&project_room(project_id)).await
    }

    pub async fn unsubscribe_from_project(&self, project_id: &str) -> Result<bool> {
        self.connection.leave_room(&project_room(project_id)).await
    }

    pub async fn subscribe_to_calendar(&self, calendar_id: &str) -> Result<bool> {
        self.connection.join_room(&calendar_room(calendar_id)).await
    }

    pub async fn unsubscribe_from_calendar(&self, calendar_id: &str) -> Result<bool> {
        self.connection.leave_room(&calendar_room(calendar_id)).await
    }

    // ---- local mutations ----

    /// Mutate a calendar entry belonging to `project_id`; `data` is the
    /// entry's full new value
    pub async fn send_calendar_update(
        &self,
        entry_id: &str,
        project_id: &str,
        action: UpdateAction,
        data: Value,
    ) -> Result<SendOutcome> {
        self.send_update(ResourceKind::Calendar, entry_id, Some(project_id), action, data)
            .await
    }

    /// Mutate a project; `data` is the project's full new value
    pub async fn send_project_update(
        &self,
        project_id: &str,
        action: UpdateAction,
        data: Value,
    ) -> Result<SendOutcome> {
        self.send_update(ResourceKind::Project, project_id, None, action, data)
            .await
    }

    /// Apply a mutation optimistically, then send it or queue it.
    ///
    /// `data` is the full new value of the resource, not a patch: receivers
    /// replace what they hold with it. A direct send stays in flight until
    /// acknowledged. A failed immediate send rolls the optimistic update back
    /// before the error is returned; retryable failures are queued for the
    /// next drain.
    pub async fn send_update(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        project_id: Option<&str>,
        action: UpdateAction,
        data: Value,
    ) -> Result<SendOutcome> {
        let version = self.state.known_version(&kind, resource_id).await;
        let mut payload = UpdatePayload::new(resource_id, action, data).with_version(version);
        payload.project_id = project_id.map(str::to_string);

        let operation_id = Uuid::new_v4().to_string();
        let tagged = payload.clone().with_operation(operation_id.clone());
        let message = ClientMessage::update(&kind, tagged).ok_or_else(|| {
            SyncError::rejected(format!("'{}' updates have no wire event", kind))
        })?;
        if let Some(project_id) = project_id {
            self.scopes
                .lock()
                .await
                .insert((kind.clone(), resource_id.to_string()), project_id.to_string());
        }
        let update = self.state.apply_optimistic_update(&kind, &payload).await?;

        let delivery = self.delivery.lock().await;
        self.track(
            &operation_id,
            &kind,
            &payload,
            Origin::Direct {
                update_id: update.id,
            },
        );
        let sent = self.connection.emit(message).await;
        if !matches!(sent, Ok(true)) {
            self.untrack(&operation_id);
        }
        drop(delivery);

        match sent {
            Ok(true) => {
                tracing::debug!(
                    "[Realtime] Sent {} {} {} as {}",
                    action.as_str(),
                    kind,
                    resource_id,
                    operation_id
                );
                return Ok(SendOutcome::Sent);
            }
            Ok(false) => {}
            Err(e) => {
                self.state
                    .rollback_with_reason(&kind, resource_id, RollbackReason::SendFailed)
                    .await?;
                if e.is_retryable() {
                    tracing::warn!("[Realtime] Send of {} {} failed, queued: {}", kind, resource_id, e);
                    self.queue.enqueue_update(kind, payload).await?;
                    self.schedule_retry_drain().await;
                } else {
                    tracing::error!("[Realtime] Send of {} {} rejected: {}", kind, resource_id, e);
                }
                self.dispatch(EngineEvent::Error(e.to_string()));
                return Err(e);
            }
        }

        let item = match self.queue.enqueue_update(kind.clone(), payload).await {
            Ok(item) => item,
            Err(e) => {
                self.state
                    .rollback_with_reason(&kind, resource_id, RollbackReason::SendFailed)
                    .await?;
                return Err(e);
            }
        };
        self.state.defer_rollback(&kind, resource_id).await;
        tracing::info!("[Realtime] Offline, queued {} {} as {}", kind, resource_id, item.id);
        Ok(SendOutcome::Queued { item_id: item.id })
    }

    // ---- queue drain ----

    /// Send every available queued item.
    ///
    /// Sent items stay `processing` until acknowledged. Only one drain runs
    /// at a time; a caller arriving mid-drain waits and then finds nothing
    /// left to do. Items in a backoff window get a follow-up drain scheduled
    /// for when they become available.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let _delivery = self.delivery.lock().await;
        let mut report = DrainReport::default();
        if !self.connection.is_connected().await {
            return Ok(report);
        }

        self.drain_metrics.lock().await.record_drain_start();
        let result = self.drain_available(&mut report).await;
        self.drain_metrics
            .lock()
            .await
            .record_drain_end(report.delivered, report.retried, report.failed);

        if !report.is_empty() {
            tracing::info!(
                "[Realtime] Drain: {} delivered, {} retrying, {} failed",
                report.delivered,
                report.retried,
                report.failed
            );
        }
        if self.connection.is_connected().await {
            self.schedule_retry_drain().await;
        }
        result.map(|_| report)
    }

    async fn drain_available(&self, report: &mut DrainReport) -> Result<()> {
        while let Some(item) = self.queue.dequeue().await? {
            let kind = item.resource_kind.clone();
            let resource_id = item.payload.resource_id.clone();

            let tagged = item.payload.clone().with_operation(item.id.clone());
            let Some(message) = ClientMessage::update(&kind, tagged) else {
                let reason = format!("'{}' updates have no wire event", kind);
                self.queue.mark_rejected(&item.id, &reason).await?;
                report.failed += 1;
                self.operation_failed(&item.id, &kind, &resource_id, reason).await;
                continue;
            };

            self.track(&item.id, &kind, &item.payload, Origin::Queue);
            let sent = self.connection.emit(message).await;
            if !matches!(sent, Ok(true)) {
                self.untrack(&item.id);
            }
            match sent {
                Ok(true) => {
                    self.state.arm_rollback(&kind, &resource_id).await;
                    report.delivered += 1;
                }
                Ok(false) => {
                    // Connection went away mid-drain; the next connect resumes
                    self.queue.release(&item.id).await?;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    match self.queue.mark_failed(&item.id, &e.to_string()).await? {
                        FailureOutcome::Retry { .. } => report.retried += 1,
                        FailureOutcome::Exhausted => {
                            report.failed += 1;
                            self.operation_failed(&item.id, &kind, &resource_id, e.to_string())
                                .await;
                        }
                    }
                }
                Err(e) => {
                    self.queue.mark_rejected(&item.id, &e.to_string()).await?;
                    report.failed += 1;
                    self.operation_failed(&item.id, &kind, &resource_id, e.to_string())
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn operation_failed(
        &self,
        item_id: &str,
        kind: &ResourceKind,
        resource_id: &str,
        error: String,
    ) {
        if let Err(e) = self
            .state
            .rollback_with_reason(kind, resource_id, RollbackReason::DeliveryFailed)
            .await
        {
            tracing::warn!("[Realtime] Rollback of {} {} failed: {}", kind, resource_id, e);
        }
        self.dispatch(EngineEvent::OperationFailed {
            item_id: item_id.to_string(),
            resource_kind: kind.clone(),
            resource_id: resource_id.to_string(),
            error,
        });
    }

    // ---- in-flight operations ----

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, InFlightTable> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, operation_id: &str, kind: &ResourceKind, payload: &UpdatePayload, origin: Origin) {
        let mut table = self.lock_in_flight();
        table.next_seq += 1;
        let seq = table.next_seq;
        table.entries.insert(
            operation_id.to_string(),
            InFlight {
                seq,
                kind: kind.clone(),
                payload: payload.clone(),
                origin,
            },
        );
    }

    fn untrack(&self, operation_id: &str) -> Option<InFlight> {
        self.lock_in_flight().entries.remove(operation_id)
    }

    /// Updates sent but not yet acknowledged
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().entries.len()
    }

    /// The server took the operation; a drained item leaves the queue
    async fn on_ack(&self, operation_id: &str) {
        let Some(entry) = self.untrack(operation_id) else {
            tracing::debug!("[Realtime] Ack for unknown operation {}", operation_id);
            return;
        };
        tracing::debug!(
            "[Realtime] {} {} acknowledged ({})",
            entry.kind,
            entry.payload.resource_id,
            operation_id
        );
        if entry.origin == Origin::Queue {
            if let Err(e) = self.queue.mark_completed(operation_id).await {
                tracing::error!("[Realtime] Could not complete {}: {}", operation_id, e);
                self.dispatch(EngineEvent::Error(e.to_string()));
            }
        }
    }

    /// The server refused the operation
    async fn on_operation_rejected(&self, operation_id: &str, error: SyncError) {
        let Some(entry) = self.untrack(operation_id) else {
            self.dispatch(EngineEvent::Error(error.to_string()));
            return;
        };
        let kind = entry.kind;
        let resource_id = entry.payload.resource_id.clone();
        tracing::warn!("[Realtime] {} {} rejected ({}): {}", kind, resource_id, operation_id, error);

        match entry.origin {
            Origin::Queue if error.is_retryable() => {
                match self.queue.mark_failed(operation_id, &error.to_string()).await {
                    Ok(FailureOutcome::Retry { .. }) => {
                        self.state.defer_rollback(&kind, &resource_id).await;
                        self.schedule_retry_drain().await;
                    }
                    Ok(FailureOutcome::Exhausted) => {
                        self.operation_failed(operation_id, &kind, &resource_id, error.to_string())
                            .await;
                    }
                    Err(e) => {
                        tracing::error!("[Realtime] Could not record failure of {}: {}", operation_id, e);
                        self.dispatch(EngineEvent::Error(e.to_string()));
                    }
                }
            }
            Origin::Queue => {
                if let Err(e) = self.queue.mark_rejected(operation_id, &error.to_string()).await {
                    tracing::error!("[Realtime] Could not record rejection of {}: {}", operation_id, e);
                }
                self.operation_failed(operation_id, &kind, &resource_id, error.to_string())
                    .await;
            }
            Origin::Direct { update_id } => {
                let current = self.state.pending_update(&kind, &resource_id).await;
                if current.map(|update| update.id) == Some(update_id) {
                    if let Err(e) = self
                        .state
                        .rollback_with_reason(&kind, &resource_id, RollbackReason::SendFailed)
                        .await
                    {
                        tracing::warn!("[Realtime] Rollback of {} {} failed: {}", kind, resource_id, e);
                    }
                    if error.is_retryable() {
                        match self.queue.enqueue_update(kind.clone(), entry.payload).await {
                            Ok(_) => self.schedule_retry_drain().await,
                            Err(e) => tracing::error!("[Realtime] Could not queue {} {}: {}", kind, resource_id, e),
                        }
                    }
                }
                self.dispatch(EngineEvent::Error(error.to_string()));
            }
        }
    }

    /// Return every unacknowledged update to the queue.
    ///
    /// Drained items go back to `pending`. A direct send is queued unless a
    /// newer local mutation or a server update has already settled its
    /// resource.
    async fn release_in_flight(&self) {
        let _delivery = self.delivery.lock().await;
        let mut entries: Vec<(String, InFlight)> =
            self.lock_in_flight().entries.drain().collect();
        if entries.is_empty() {
            return;
        }
        entries.sort_by_key(|(_, entry)| entry.seq);

        let mut released = 0;
        for (operation_id, entry) in entries {
            let kind = entry.kind;
            let resource_id = entry.payload.resource_id.clone();
            let requeued = match entry.origin {
                Origin::Queue => self.queue.release(&operation_id).await.map(|_| true),
                Origin::Direct { update_id } => {
                    let current = self.state.pending_update(&kind, &resource_id).await;
                    if current.map(|update| update.id) == Some(update_id) {
                        self.queue
                            .enqueue_update(kind.clone(), entry.payload)
                            .await
                            .map(|_| true)
                    } else {
                        tracing::debug!("[Realtime] {} {} settled while in flight", kind, resource_id);
                        Ok(false)
                    }
                }
            };
            match requeued {
                Ok(true) => {
                    self.state.defer_rollback(&kind, &resource_id).await;
                    released += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("[Realtime] Could not re-queue {}: {}", operation_id, e);
                    self.dispatch(EngineEvent::Error(e.to_string()));
                }
            }
        }
        tracing::info!("[Realtime] {} unacknowledged updates returned to the queue", released);
    }

    /// Drain again once the earliest backed-off item becomes available
    fn schedule_retry_drain(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let delay = match self.queue.next_retry_in().await {
                Ok(Some(delay)) => delay,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("[Realtime] Could not read retry schedule: {}", e);
                    return;
                }
            };

            let mut slot = self.lock_retry_timer();
            if slot.as_ref().map_or(false, |timer| !timer.is_finished()) {
                return;
            }
            tracing::debug!("[Realtime] Next drain in {:?}", delay);
            let weak = self.self_ref.clone();
            *slot = Some(
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    manager.lock_retry_timer().take();
                    if let Err(e) = manager.drain_queue().await {
                        tracing::error!("[Realtime] Retry drain failed: {}", e);
                        manager.dispatch(EngineEvent::Error(e.to_string()));
                    }
                })
                .abort_handle(),
            );
        })
    }

    fn lock_retry_timer(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.retry_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- inbound routing ----

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged { previous, current } => {
                if previous == ConnectionStatus::Connected && current != ConnectionStatus::Connected {
                    self.release_in_flight().await;
                }
                self.dispatch(EngineEvent::StatusChanged { previous, current });
                if current == ConnectionStatus::Connected {
                    self.resend_refetches().await;
                    if let Err(e) = self.drain_queue().await {
                        tracing::error!("[Realtime] Drain after reconnect failed: {}", e);
                        self.dispatch(EngineEvent::Error(e.to_string()));
                    }
                }
            }
            ConnectionEvent::Message(message) => self.on_server_message(message).await,
            ConnectionEvent::Error(message) => self.dispatch(EngineEvent::Error(message)),
        }
    }

    async fn on_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::CalendarUpdate(payload) => {
                self.on_remote_update(ResourceKind::Calendar, payload).await
            }
            ServerMessage::ProjectUpdate(payload) => {
                self.on_remote_update(ResourceKind::Project, payload).await
            }
            ServerMessage::ConflictDetected(event) => self.on_conflict(event).await,
            ServerMessage::Snapshot(snapshot) => self.on_snapshot(snapshot).await,
            ServerMessage::Ack(ack) => self.on_ack(&ack.operation_id).await,
            ServerMessage::Error(error) => match &error.operation_id {
                Some(operation_id) => {
                    self.on_operation_rejected(operation_id, error.to_error())
                        .await
                }
                None => {
                    tracing::warn!("[Realtime] Server error {:?}: {}", error.status, error.message);
                    self.dispatch(EngineEvent::Error(error.message));
                }
            },
            // Consumed by the connection manager
            ServerMessage::Pong(_) => {}
        }
    }

    async fn on_remote_update(&self, kind: ResourceKind, payload: UpdatePayload) {
        // An echo of our own operation doubles as its acknowledgment
        if let Some(operation_id) = &payload.operation_id {
            self.on_ack(operation_id).await;
        }

        let own_update = self
            .state
            .pending_update(&kind, &payload.resource_id)
            .await
            .is_some();
        if !own_update && !self.in_scope(&kind, &payload).await {
            self.audit.log_suspicious_activity(
                &format!("{} update outside joined rooms", kind),
                Some(payload.resource_id.as_str()),
            );
            tracing::warn!(
                "[Realtime] Dropping {} {} update from an unsubscribed room",
                kind,
                payload.resource_id
            );
            return;
        }

        if let Some(project_id) = &payload.project_id {
            self.scopes
                .lock()
                .await
                .insert((kind.clone(), payload.resource_id.clone()), project_id.clone());
        }
        self.audit
            .log_data_access(&kind, &payload.resource_id, payload.action.as_str());
        match self.state.handle_incoming_update(&kind, &payload).await {
            Ok(IncomingOutcome::Ignored) => {}
            Ok(outcome) => self.dispatch(EngineEvent::ResourceChanged {
                resource_kind: kind,
                resource_id: payload.resource_id,
                outcome,
            }),
            Err(e) => {
                tracing::error!("[Realtime] Could not apply {} {}: {}", kind, payload.resource_id, e);
                self.dispatch(EngineEvent::Error(e.to_string()));
            }
        }
    }

    /// Whether an inbound update belongs to a joined room
    async fn in_scope(&self, kind: &ResourceKind, payload: &UpdatePayload) -> bool {
        let mut rooms = Vec::new();
        if let Some(project_id) = &payload.project_id {
            rooms.push(project_room(project_id));
            rooms.push(calendar_room(project_id));
        }
        match kind {
            ResourceKind::Calendar => rooms.push(calendar_room(&payload.resource_id)),
            ResourceKind::Project => rooms.push(project_room(&payload.resource_id)),
            ResourceKind::Custom(_) => {}
        }
        for room in rooms {
            if self.connection.is_in_room(&room).await {
                return true;
            }
        }
        false
    }

    async fn on_conflict(&self, event: ConflictEvent) {
        let resolution = match self.resolver.resolve_conflict(&event) {
            Ok(None) => {
                tracing::debug!(
                    "[Realtime] {} {}: both sides agree, nothing to resolve",
                    event.resource_kind,
                    event.resource_id
                );
                return;
            }
            Ok(Some(resolution)) if resolution.needs_refetch => {
                self.request_refetch(&event).await;
                return;
            }
            Ok(Some(resolution)) => resolution,
            Err(e) => {
                tracing::error!(
                    "[Realtime] Conflict on {} {} left unresolved: {}",
                    event.resource_kind,
                    event.resource_id,
                    e
                );
                self.dispatch(EngineEvent::Error(e.to_string()));
                return;
            }
        };

        match self.state.apply_conflict_resolution(&event, &resolution).await {
            Ok(_) => self.dispatch(EngineEvent::ConflictResolved {
                resource_kind: event.resource_kind,
                resource_id: event.resource_id,
                strategy: resolution.strategy,
                version: resolution.resulting_version,
            }),
            Err(e) => {
                tracing::error!("[Realtime] Could not apply resolution: {}", e);
                self.dispatch(EngineEvent::Error(e.to_string()));
            }
        }
    }

    /// Ask for authoritative state; one outstanding fetch per resource
    async fn request_refetch(&self, event: &ConflictEvent) {
        let key = (event.resource_kind.clone(), event.resource_id.clone());
        let project_id = self.scopes.lock().await.get(&key).cloned();
        {
            let mut refetches = self.refetches.lock().await;
            if let Some(pending) = refetches.get_mut(&key) {
                pending.changes.extend(event.local_changes.clone());
                tracing::debug!("[Realtime] Refetch of {} {} already in flight", key.0, key.1);
                return;
            }
            refetches.insert(
                key.clone(),
                PendingRefetch {
                    changes: event.local_changes.clone(),
                    project_id,
                },
            );
        }
        tracing::info!("[Realtime] Version mismatch on {} {}, refetching", key.0, key.1);
        self.send_fetch(&key).await;
    }

    async fn send_fetch(&self, key: &ResourceKey) {
        let fetch = ClientMessage::Fetch(FetchPayload {
            resource_kind: key.0.clone(),
            resource_id: key.1.clone(),
        });
        match self.connection.emit(fetch).await {
            Ok(true) => {}
            // Resent after the next reconnect
            Ok(false) => {}
            Err(e) => {
                tracing::error!("[Realtime] Refetch of {} {} failed: {}", key.0, key.1, e);
                self.refetches.lock().await.remove(key);
                self.dispatch(EngineEvent::Error(e.to_string()));
            }
        }
    }

    async fn resend_refetches(&self) {
        let keys: Vec<ResourceKey> = self.refetches.lock().await.keys().cloned().collect();
        for key in keys {
            self.send_fetch(&key).await;
        }
    }

    /// Apply authoritative state, then re-apply local changes waiting on it
    async fn on_snapshot(&self, snapshot: SnapshotPayload) {
        let SnapshotPayload {
            resource_kind: kind,
            resource_id,
            data,
            version,
        } = snapshot;
        let key = (kind.clone(), resource_id.clone());
        let pending = self.refetches.lock().await.remove(&key);

        let base = data.clone();
        match self.state.apply_snapshot(&kind, &resource_id, data, version).await {
            Ok(IncomingOutcome::Ignored) => return,
            Ok(outcome) => self.dispatch(EngineEvent::ResourceChanged {
                resource_kind: kind.clone(),
                resource_id: resource_id.clone(),
                outcome,
            }),
            Err(e) => {
                tracing::error!("[Realtime] Could not apply snapshot of {} {}: {}", kind, resource_id, e);
                self.dispatch(EngineEvent::Error(e.to_string()));
                return;
            }
        }

        let Some(PendingRefetch {
            changes,
            project_id,
        }) = pending.filter(|pending| !pending.changes.is_empty())
        else {
            return;
        };
        let Value::Object(mut merged) = base else {
            tracing::info!("[Realtime] {} {} was deleted on the server, local edits dropped", kind, resource_id);
            return;
        };
        merged.extend(changes);

        tracing::info!("[Realtime] Re-applying local edits to {} {} at version {}", kind, resource_id, version);
        if let Err(e) = self
            .send_update(
                kind,
                &resource_id,
                project_id.as_deref(),
                UpdateAction::Update,
                Value::Object(merged),
            )
            .await
        {
            tracing::warn!("[Realtime] Re-apply of {} failed: {}", resource_id, e);
        }
    }

    // ---- observers ----

    /// Subscribe to every engine event
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn on_connection_status_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let mut listeners = self.write_listeners();
        let id = listeners.next();
        listeners.status.push((id, Arc::new(callback)));
        id
    }

    pub fn on_sync_queue_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&QueueStats) + Send + Sync + 'static,
    {
        let mut listeners = self.write_listeners();
        let id = listeners.next();
        listeners.queue.push((id, Arc::new(callback)));
        id
    }

    /// Errors and permanently failed operations
    pub fn on_error<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut listeners = self.write_listeners();
        let id = listeners.next();
        listeners.error.push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the id was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.write_listeners();
        let before = listeners.status.len() + listeners.queue.len() + listeners.error.len();
        listeners.status.retain(|(listener, _)| *listener != id);
        listeners.queue.retain(|(listener, _)| *listener != id);
        listeners.error.retain(|(listener, _)| *listener != id);
        before != listeners.status.len() + listeners.queue.len() + listeners.error.len()
    }

    fn write_listeners(&self) -> std::sync::RwLockWriteGuard<'_, Listeners> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, event: EngineEvent) {
        // Callbacks run without the lock so they may (un)register listeners
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &event {
            EngineEvent::StatusChanged { current, .. } => {
                let callbacks: Vec<StatusCallback> =
                    listeners.status.iter().map(|(_, cb)| cb.clone()).collect();
                drop(listeners);
                for callback in callbacks {
                    callback(*current);
                }
            }
            EngineEvent::QueueUpdated(stats) => {
                let callbacks: Vec<QueueCallback> =
                    listeners.queue.iter().map(|(_, cb)| cb.clone()).collect();
                drop(listeners);
                for callback in callbacks {
                    callback(stats);
                }
            }
            EngineEvent::Error(message) => {
                let callbacks: Vec<ErrorCallback> =
                    listeners.error.iter().map(|(_, cb)| cb.clone()).collect();
                drop(listeners);
                for callback in callbacks {
                    callback(message);
                }
            }
            EngineEvent::OperationFailed {
                resource_kind,
                resource_id,
                error,
                ..
            } => {
                let callbacks: Vec<ErrorCallback> =
                    listeners.error.iter().map(|(_, cb)| cb.clone()).collect();
                drop(listeners);
                let message = format!("{} {} failed permanently: {}", resource_kind, resource_id, error);
                for callback in callbacks {
                    callback(&message);
                }
            }
            EngineEvent::ResourceChanged { .. } | EngineEvent::ConflictResolved { .. } => {}
        }
        let _ = self.events.send(event);
    }

    // ---- accessors ----

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.connection.status().await
    }

    pub async fn get_connection_metrics(&self) -> ConnectionMetrics {
        self.connection.get_metrics().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn get_sync_queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Queued operations that failed for good
    pub fn failed_operation_count(&self) -> usize {
        self.queue.current_stats().failed
    }

    pub fn state(&self) -> &Arc<StateSync> {
        &self.state
    }

    /// Register custom resolvers here
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub async fn sync_metrics(&self) -> SyncMetrics {
        self.drain_metrics.lock().await.clone()
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        for task in self.lifecycle.get_mut().tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = self
            .retry_timer
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            timer.abort();
        }
    }
}

/// The engine's event loop: connection events are handled one at a time
async fn route_connection_events(
    manager: Weak<RealtimeManager>,
    mut events: UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.on_connection_event(event).await;
    }
}

async fn forward_queue_stats(manager: Weak<RealtimeManager>, mut stats: watch::Receiver<QueueStats>) {
    while stats.changed().await.is_ok() {
        let current = stats.borrow_and_update().clone();
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.dispatch(EngineEvent::QueueUpdated(current));
    }
}
