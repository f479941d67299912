//! # Offline Editing Support
//!
//! Lets the user keep editing while disconnected: mutations are applied to
//! local state optimistically and persisted in a durable queue until they
//! can be delivered.
//!
//! ## Key Components
//!
//! - `optimistic.rs`: [`StateSync`], optimistic apply, confirmation and rollback
//! - `queue.rs`: [`SyncQueue`], the durable priority queue
//! - `retry.rs`: backoff strategies and the retry budget
//!
//! ## Usage
//!
//! ```rust,no_run
//! use schedsync::local_db::MemoryQueueStore;
//! use schedsync::offline::{RetryPolicy, StateSync, SyncQueue};
//! use schedsync::shared::{ResourceKind, UpdateAction, UpdatePayload};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> schedsync::shared::Result<()> {
//! let state = StateSync::in_memory(Duration::from_secs(30));
//! let queue = SyncQueue::new(Arc::new(MemoryQueueStore::new()), RetryPolicy::default());
//!
//! let payload = UpdatePayload::new("s1", UpdateAction::Update, serde_json::json!({"title": "X"}));
//! state.apply_optimistic_update(&ResourceKind::Calendar, &payload).await?;
//! queue.enqueue_update(ResourceKind::Calendar, payload).await?;
//! # Ok(())
//! # }
//! ```

pub mod optimistic;
pub mod queue;
pub mod retry;

// Re-export main types
pub use optimistic::{
    IncomingOutcome, OptimisticUpdate, RollbackReason, StateSync, StateSyncBuilder,
    StateSyncEvent,
};
pub use queue::{Priority, QueueItemStatus, QueueStats, SyncQueue, SyncQueueItem};
pub use retry::{BackoffStrategy, FailureOutcome, RetryPolicy};
