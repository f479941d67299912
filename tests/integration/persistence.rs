//! Durable queue behaviour across restarts

use crate::common::TestEngine;
use pretty_assertions::assert_eq;
use schedsync::local_db::SqliteQueueStore;
use schedsync::offline::{
    BackoffStrategy, FailureOutcome, Priority, QueueItemStatus, RetryPolicy, SyncQueue,
};
use schedsync::shared::{EngineConfig, ResourceKind, UpdateAction, UpdatePayload};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_queued_mutation_survives_restart_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let store = SqliteQueueStore::open(&path).await.unwrap();
        let t = TestEngine::with_store(EngineConfig::default(), Arc::new(store), false);
        t.engine
            .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
            .await
            .unwrap();
        assert_eq!(t.engine.get_sync_queue().len().await.unwrap(), 1);
    }

    let store = SqliteQueueStore::open(&path).await.unwrap();
    let queue = SyncQueue::new(Arc::new(store.clone()), RetryPolicy::default());
    let items = queue.dequeue_all().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].resource_kind, ResourceKind::Calendar);
    assert_eq!(items[0].payload.resource_id, "s1");
    assert_eq!(items[0].payload.data, json!({"title": "X"}));
    assert_eq!(items[0].priority, Priority::High);

    let mut t = TestEngine::with_store(EngineConfig::default(), Arc::new(store), true);
    t.start().await;
    t.engine.drain_queue().await.unwrap();
    t.wait_for_empty_queue().await;

    assert_eq!(t.peer.sent_updates().len(), 1);
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_claim_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let store = SqliteQueueStore::open(&path).await.unwrap();
        let queue = SyncQueue::new(Arc::new(store), RetryPolicy::default());
        let payload = UpdatePayload::new("p1", UpdateAction::Update, json!({"name": "A"}));
        queue.enqueue_update(ResourceKind::Project, payload).await.unwrap();
        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.status, QueueItemStatus::Processing);
        // Process dies before the delivery outcome is recorded
    }

    let store = SqliteQueueStore::open(&path).await.unwrap();
    let queue = SyncQueue::new(Arc::new(store), RetryPolicy::default());
    assert!(queue.dequeue().await.unwrap().is_none());

    assert_eq!(queue.recover().await.unwrap(), 1);
    let item = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(item.payload.resource_id, "p1");
    assert_eq!(item.retry_count, 0);
}

#[tokio::test]
async fn test_last_retry_fails_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteQueueStore::open(dir.path().join("queue.db")).await.unwrap();
    let policy = RetryPolicy::new(
        3,
        BackoffStrategy::Fixed {
            interval: Duration::ZERO,
        },
    );
    let queue = SyncQueue::new(Arc::new(store), policy);

    let payload = UpdatePayload::new("s1", UpdateAction::Create, json!({"title": "X"}));
    let item = queue.enqueue_update(ResourceKind::Calendar, payload).await.unwrap();

    for attempt in 1..3 {
        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, item.id);
        let outcome = queue.mark_failed(&claimed.id, "connection reset").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retry { .. }), "attempt {}", attempt);
    }

    // retry_count == max_retries - 1: one more failure exhausts the item
    let claimed = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(claimed.retry_count, 2);
    assert!(claimed.is_last_attempt());
    let outcome = queue.mark_failed(&claimed.id, "connection reset").await.unwrap();
    assert_eq!(outcome, FailureOutcome::Exhausted);

    let stored = queue.get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueItemStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("connection reset"));
    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(queue.failed_items().await.unwrap().len(), 1);

    assert_eq!(queue.purge_failed().await.unwrap(), 1);
    assert_eq!(queue.stats().await.unwrap().total(), 0);
}
