//! # Sync Queue
//!
//! Durable queue of mutations that could not be delivered while offline.
//! Items survive process restarts because every mutation goes straight to
//! the [`QueueStore`].
//!
//! ## Features
//!
//! - **Persistent Queue**: Backed by a [`QueueStore`] (SQLite by default)
//! - **Priority Support**: Higher priority and older items drain first
//! - **Atomic Claims**: `dequeue` flips the claimed item to `processing`
//! - **Retry Bookkeeping**: Backoff re-availability, permanent failure after `max_retries`
//! - **Stats Feed**: A `watch` channel publishes [`QueueStats`] after every mutation,
//!   adjusted in place rather than recounted from the store
//!
//! ## Usage
//!
//! ```rust,no_run
//! use schedsync::local_db::MemoryQueueStore;
//! use schedsync::offline::{RetryPolicy, SyncQueue};
//! use schedsync::shared::{ResourceKind, UpdateAction, UpdatePayload};
//! use std::sync::Arc;
//!
//! # async fn example() -> schedsync::shared::Result<()> {
//! let queue = SyncQueue::new(Arc::new(MemoryQueueStore::new()), RetryPolicy::default());
//!
//! let payload = UpdatePayload::new("s1", UpdateAction::Create, serde_json::json!({"title": "X"}));
//! queue.enqueue_update(ResourceKind::Calendar, payload).await?;
//!
//! while let Some(item) = queue.dequeue().await? {
//!     // Deliver item...
//!     queue.mark_completed(&item.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::local_db::QueueStore;
use crate::offline::retry::{FailureOutcome, RetryPolicy};
use crate::shared::error::{Result, SyncError};
use crate::shared::event::{ResourceKind, UpdateAction, UpdatePayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Drain priority of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Default priority for a resource kind.
    ///
    /// Calendar edits are time-sensitive for other attendees, so they drain
    /// ahead of project edits.
    pub fn for_kind(kind: &ResourceKind) -> Self {
        match kind {
            ResourceKind::Calendar => Priority::High,
            ResourceKind::Project => Priority::Medium,
            ResourceKind::Custom(_) => Priority::Low,
        }
    }

    /// Numeric level stored in the queue table
    pub fn level(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    /// Inverse of [`level`](Self::level); out-of-range values clamp
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Medium,
            _ => Priority::High,
        }
    }
}

/// Lifecycle state of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a drain loop
    Processing,
    /// Permanently failed, kept for user-visible reporting
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "failed" => Ok(QueueItemStatus::Failed),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queued outbound mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Unique item id
    pub id: String,
    /// create / update / delete
    pub operation_type: UpdateAction,
    /// Resource kind the mutation targets
    pub resource_kind: ResourceKind,
    /// Wire payload sent on delivery
    pub payload: UpdatePayload,
    /// When the item was queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub retry_count: u32,
    /// Failures tolerated before the item is marked failed
    pub max_retries: u32,
    /// Drain priority
    pub priority: Priority,
    /// Current status
    pub status: QueueItemStatus,
    /// Earliest time the item may be claimed again
    pub available_at: DateTime<Utc>,
    /// Error from the last failed attempt
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// New pending item, available immediately
    pub fn new(
        resource_kind: ResourceKind,
        payload: UpdatePayload,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            operation_type: payload.action,
            resource_kind,
            payload,
            enqueued_at: now,
            retry_count: 0,
            max_retries,
            priority,
            status: QueueItemStatus::Pending,
            available_at: now,
            last_error: None,
        }
    }

    /// Whether one more failure exhausts the item
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items waiting to be claimed (including those in backoff)
    pub pending: usize,
    /// Items claimed by a drain loop
    pub processing: usize,
    /// Permanently failed items
    pub failed: usize,
}

impl QueueStats {
    /// Items still to be delivered
    pub fn outstanding(&self) -> usize {
        self.pending + self.processing
    }

    fn count_mut(&mut self, status: QueueItemStatus) -> &mut usize {
        match status {
            QueueItemStatus::Pending => &mut self.pending,
            QueueItemStatus::Processing => &mut self.processing,
            QueueItemStatus::Failed => &mut self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.failed
    }
}

/// Wall-clock time derived from the tokio clock, so backoff windows follow
/// paused or advanced test time.
#[derive(Debug, Clone, Copy)]
struct QueueClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl QueueClock {
    fn new() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

/// Durable priority queue of offline operations
pub struct SyncQueue {
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    clock: QueueClock,
    stats_tx: watch::Sender<QueueStats>,
    /// The published stats were counted from the store at least once
    primed: AtomicBool,
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("policy", &self.policy)
            .field("stats", &*self.stats_tx.borrow())
            .finish()
    }
}

impl SyncQueue {
    /// Create a queue over `store`
    pub fn new(store: Arc<dyn QueueStore>, policy: RetryPolicy) -> Self {
        let (stats_tx, _) = watch::channel(QueueStats::default());
        Self {
            store,
            policy,
            clock: QueueClock::new(),
            stats_tx,
            primed: AtomicBool::new(false),
        }
    }

    /// Retry policy applied by [`mark_failed`](Self::mark_failed)
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist an item
    pub async fn enqueue(&self, mut item: SyncQueueItem) -> Result<String> {
        let now = self.clock.now();
        item.status = QueueItemStatus::Pending;
        item.enqueued_at = now;
        item.available_at = now;
        let previous = self.store.get(&item.id).await?.map(|existing| existing.status);
        self.store.put(&item).await?;

        tracing::debug!(
            "[Queue] Enqueued {} {} {} (priority {:?})",
            item.operation_type.as_str(),
            item.resource_kind,
            item.payload.resource_id,
            item.priority
        );
        self.adjust(previous, Some(QueueItemStatus::Pending)).await;
        Ok(item.id)
    }

    /// Queue a wire update with the kind's default priority
    pub async fn enqueue_update(
        &self,
        kind: ResourceKind,
        payload: UpdatePayload,
    ) -> Result<SyncQueueItem> {
        let priority = Priority::for_kind(&kind);
        let mut item = SyncQueueItem::new(kind, payload, priority, self.policy.max_retries);
        item.id = self.enqueue(item.clone()).await?;
        self.store
            .get(&item.id)
            .await?
            .ok_or(SyncError::UnknownItem { id: item.id })
    }

    /// Claim the highest-priority, oldest available item
    pub async fn dequeue(&self) -> Result<Option<SyncQueueItem>> {
        let claimed = self.store.claim_next(self.clock.now()).await?;
        if let Some(item) = &claimed {
            tracing::debug!("[Queue] Claimed {} (retry {})", item.id, item.retry_count);
            self.adjust(Some(QueueItemStatus::Pending), Some(QueueItemStatus::Processing))
                .await;
        }
        Ok(claimed)
    }

    /// All pending items in drain order, without claiming them
    pub async fn dequeue_all(&self) -> Result<Vec<SyncQueueItem>> {
        self.store.scan_by_status(QueueItemStatus::Pending).await
    }

    /// Fetch an item by id
    pub async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        self.store.get(id).await
    }

    /// Delivery acknowledged; remove the item
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let Some(item) = self.store.get(id).await? else {
            tracing::debug!("[Queue] {} already gone", id);
            return Ok(());
        };
        self.store.delete(id).await?;
        tracing::debug!("[Queue] Completed {}", id);
        self.adjust(Some(item.status), None).await;
        Ok(())
    }

    /// Record a retryable failure.
    ///
    /// Below the retry budget the item goes back to `pending` behind a
    /// backoff window; otherwise it is marked `failed` for good.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<FailureOutcome> {
        let mut item = self.require(id).await?;
        let previous = item.status;
        item.retry_count += 1;
        item.last_error = Some(error.to_string());

        let outcome =
            RetryPolicy::outcome_with(item.retry_count, item.max_retries, &self.policy.backoff);
        match outcome {
            FailureOutcome::Retry { delay } => {
                item.status = QueueItemStatus::Pending;
                item.available_at = self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                tracing::warn!(
                    "[Queue] {} failed (attempt {}/{}), retrying in {:?}: {}",
                    id,
                    item.retry_count,
                    item.max_retries,
                    delay,
                    error
                );
            }
            FailureOutcome::Exhausted => {
                item.status = QueueItemStatus::Failed;
                tracing::error!(
                    "[Queue] {} failed permanently after {} attempts: {}",
                    id,
                    item.retry_count,
                    error
                );
            }
        }

        self.store.put(&item).await?;
        self.adjust(Some(previous), Some(item.status)).await;
        Ok(outcome)
    }

    /// Record a non-retryable failure; the item is marked `failed` at once
    pub async fn mark_rejected(&self, id: &str, reason: &str) -> Result<()> {
        let mut item = self.require(id).await?;
        let previous = item.status;
        item.status = QueueItemStatus::Failed;
        item.last_error = Some(reason.to_string());
        self.store.put(&item).await?;

        tracing::error!("[Queue] {} rejected: {}", id, reason);
        self.adjust(Some(previous), Some(QueueItemStatus::Failed)).await;
        Ok(())
    }

    /// Return a claimed item to `pending` without counting an attempt
    pub async fn release(&self, id: &str) -> Result<()> {
        let mut item = self.require(id).await?;
        if item.status == QueueItemStatus::Processing {
            item.status = QueueItemStatus::Pending;
            self.store.put(&item).await?;
            self.adjust(Some(QueueItemStatus::Processing), Some(QueueItemStatus::Pending))
                .await;
        }
        Ok(())
    }

    /// Reset items a previous process left in `processing`
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.reset_processing().await?;
        if recovered > 0 {
            tracing::info!("[Queue] Recovered {} interrupted operations", recovered);
        }
        self.refresh().await;
        Ok(recovered)
    }

    /// Prepare for shutdown: nothing stays claimed
    pub async fn flush(&self) -> Result<usize> {
        let released = self.reset_processing().await?;
        tracing::debug!("[Queue] Flushed, {} claims released", released);
        self.refresh().await;
        Ok(released)
    }

    /// Remove every item, failed ones included
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        tracing::info!("[Queue] Cleared");
        self.refresh().await;
        Ok(())
    }

    /// Permanently failed items
    pub async fn failed_items(&self) -> Result<Vec<SyncQueueItem>> {
        self.store.scan_by_status(QueueItemStatus::Failed).await
    }

    /// Drop permanently failed items once the user has seen them
    pub async fn purge_failed(&self) -> Result<usize> {
        let failed = self.failed_items().await?;
        for item in &failed {
            self.store.delete(&item.id).await?;
        }
        self.refresh().await;
        Ok(failed.len())
    }

    /// Earliest time a pending item becomes claimable
    pub async fn next_available_at(&self) -> Result<Option<DateTime<Utc>>> {
        let pending = self.store.scan_by_status(QueueItemStatus::Pending).await?;
        Ok(pending.iter().map(|item| item.available_at).min())
    }

    /// Time until the next pending item becomes claimable (zero if one is
    /// claimable now)
    pub async fn next_retry_in(&self) -> Result<Option<std::time::Duration>> {
        let now = self.clock.now();
        Ok(self
            .next_available_at()
            .await?
            .map(|at| (at - now).to_std().unwrap_or(std::time::Duration::ZERO)))
    }

    /// Items still to be delivered
    pub async fn len(&self) -> Result<usize> {
        Ok(self.stats().await?.outstanding())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Count items per status
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.store.scan_all().await? {
            match item.status {
                QueueItemStatus::Pending => stats.pending += 1,
                QueueItemStatus::Processing => stats.processing += 1,
                QueueItemStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Stats published after every mutation
    pub fn subscribe(&self) -> watch::Receiver<QueueStats> {
        self.stats_tx.subscribe()
    }

    /// Last published stats
    pub fn current_stats(&self) -> QueueStats {
        self.stats_tx.borrow().clone()
    }

    async fn require(&self, id: &str) -> Result<SyncQueueItem> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SyncError::UnknownItem { id: id.to_string() })
    }

    async fn reset_processing(&self) -> Result<usize> {
        let claimed = self.store.scan_by_status(QueueItemStatus::Processing).await?;
        for mut item in claimed.iter().cloned() {
            item.status = QueueItemStatus::Pending;
            self.store.put(&item).await?;
        }
        Ok(claimed.len())
    }

    /// Recount from the store; bulk operations end here
    async fn refresh(&self) {
        match self.stats().await {
            Ok(stats) => {
                self.primed.store(true, Ordering::SeqCst);
                self.stats_tx.send_if_modified(|current| {
                    if *current == stats {
                        false
                    } else {
                        *current = stats;
                        true
                    }
                });
            }
            Err(e) => tracing::warn!("[Queue] Failed to refresh stats: {}", e),
        }
    }

    /// Move one item between statuses in the published stats; `None` is
    /// outside the queue. The first mutation counts from the store instead.
    async fn adjust(&self, from: Option<QueueItemStatus>, to: Option<QueueItemStatus>) {
        if !self.primed.load(Ordering::SeqCst) {
            self.refresh().await;
            return;
        }
        if from == to {
            return;
        }
        self.stats_tx.send_if_modified(|stats| {
            if let Some(from) = from {
                let count = stats.count_mut(from);
                *count = count.saturating_sub(1);
            }
            if let Some(to) = to {
                *stats.count_mut(to) += 1;
            }
            true
        });
    }
}
