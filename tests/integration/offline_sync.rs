//! Offline editing, queue drain and rollback through the engine

use crate::common::TestEngine;
use pretty_assertions::assert_eq;
use schedsync::local_db::MemoryQueueStore;
use schedsync::offline::{IncomingOutcome, Priority};
use schedsync::realtime::{ConnectionStatus, EngineEvent, SendFailure, SendOutcome};
use schedsync::shared::event::ServerErrorPayload;
use schedsync::shared::{
    AckPayload, ClientMessage, EngineConfig, ResourceKind, ServerMessage, UpdateAction,
    UpdatePayload,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_offline_mutation_is_applied_and_queued() {
    let t = TestEngine::offline();

    let outcome = t
        .engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();

    assert!(matches!(outcome, SendOutcome::Queued { .. }));
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "X"})));
    assert_eq!(t.engine.get_sync_queue().len().await.unwrap(), 1);
    assert_eq!(t.engine.connection_status().await, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_offline_emit_never_reaches_transport() {
    let t = TestEngine::offline();

    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();
    t.engine
        .send_project_update("p1", UpdateAction::Update, json!({"name": "Launch"}))
        .await
        .unwrap();

    assert!(t.peer.sent().is_empty());
    let items = t.engine.get_sync_queue().dequeue_all().await.unwrap();
    assert_eq!(items.len(), 2);
    // Calendar first: higher priority drains first
    assert_eq!(items[0].resource_kind, ResourceKind::Calendar);
    assert_eq!(items[0].priority, Priority::High);
    assert_eq!(items[1].resource_kind, ResourceKind::Project);
    assert_eq!(items[1].priority, Priority::Medium);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_drains_queue_without_rollback() {
    let mut t = TestEngine::online();
    t.peer.set_echo_updates(true);

    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();
    assert_eq!(t.engine.get_sync_queue().len().await.unwrap(), 1);

    t.start().await;
    let event = t
        .wait_for(|event| matches!(event, EngineEvent::ResourceChanged { .. }))
        .await;
    assert_eq!(
        event,
        EngineEvent::ResourceChanged {
            resource_kind: ResourceKind::Calendar,
            resource_id: "s1".into(),
            outcome: IncomingOutcome::Confirmed,
        }
    );
    t.wait_for_empty_queue().await;
    assert_eq!(t.peer.sent_updates().len(), 1);

    // Well past the rollback timeout: nothing was rolled back
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "X"})));
}

#[tokio::test(start_paused = true)]
async fn test_drain_twice_is_a_noop() {
    let mut t = TestEngine::online();
    for id in ["s1", "s2"] {
        t.engine
            .send_calendar_update(id, "p1", UpdateAction::Create, json!({"title": id}))
            .await
            .unwrap();
    }

    t.start().await;
    t.engine.drain_queue().await.unwrap();
    t.wait_for_empty_queue().await;

    let second = t.engine.drain_queue().await.unwrap();
    assert!(second.is_empty());
    let third = t.engine.drain_queue().await.unwrap();
    assert!(third.is_empty());
    assert_eq!(t.peer.sent_updates().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_update_rolls_back_after_timeout() {
    let mut t = TestEngine::online();
    t.start().await;
    t.engine.subscribe_to_project("p1").await.unwrap();

    let existing = UpdatePayload::new("s1", UpdateAction::Create, json!({"title": "A"}))
        .with_project("p1")
        .with_version(1);
    t.peer.push(ServerMessage::CalendarUpdate(existing));
    t.wait_for(|event| matches!(event, EngineEvent::ResourceChanged { .. }))
        .await;

    let outcome = t
        .engine
        .send_calendar_update("s1", "p1", UpdateAction::Update, json!({"title": "B"}))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "B"})));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "B"})));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "A"})));
    assert_eq!(t.engine.state().pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sent_update_carries_known_version() {
    let mut t = TestEngine::online();
    t.start().await;
    t.engine.subscribe_to_project("p1").await.unwrap();

    let existing = UpdatePayload::new("s1", UpdateAction::Create, json!({"title": "A"}))
        .with_project("p1")
        .with_version(7);
    t.peer.push(ServerMessage::CalendarUpdate(existing));
    t.wait_for(|event| matches!(event, EngineEvent::ResourceChanged { .. }))
        .await;

    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Update, json!({"title": "B"}))
        .await
        .unwrap();

    match t.peer.sent_updates().last() {
        Some(ClientMessage::CalendarUpdate(payload)) => {
            assert_eq!(payload.version, 7);
            assert_eq!(payload.project_id.as_deref(), Some("p1"));
        }
        other => panic!("expected a calendar update, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_drop_queues_and_reconnect_delivers() {
    let mut t = TestEngine::online();
    t.start().await;

    t.peer.drop_connection("server restart");
    t.wait_for_status(ConnectionStatus::Reconnecting).await;

    let outcome = t
        .engine
        .send_project_update("p1", UpdateAction::Update, json!({"name": "Offline edit"}))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Queued { .. }));
    assert!(t.peer.sent_updates().is_empty());

    t.peer.connect();
    t.wait_for_status(ConnectionStatus::Connected).await;
    t.engine.drain_queue().await.unwrap();
    t.wait_for_empty_queue().await;

    assert_eq!(t.peer.sent_updates().len(), 1);
    assert_eq!(t.engine.get_connection_metrics().await.reconnection_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_delivery_fails_permanently_and_rolls_back() {
    let mut t = TestEngine::online();
    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": ""}))
        .await
        .unwrap();
    t.peer
        .fail_sends(Some(SendFailure::Server(422, "title must not be empty".into())));

    t.start().await;
    let event = t
        .wait_for(|event| matches!(event, EngineEvent::OperationFailed { .. }))
        .await;
    assert!(matches!(
        event,
        EngineEvent::OperationFailed { ref resource_id, .. } if resource_id == "s1"
    ));

    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, None);
    assert_eq!(t.engine.failed_operation_count(), 1);
    assert!(t.engine.get_sync_queue().is_empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_exhaust_after_max_retries() {
    let config = EngineConfig::builder()
        .max_retries(2)
        .backoff_table(vec![Duration::from_secs(1)])
        .build()
        .unwrap();
    let mut t = TestEngine::with_store(config, Arc::new(MemoryQueueStore::new()), true);
    t.start().await;
    t.peer
        .fail_sends(Some(SendFailure::Server(503, "unavailable".into())));

    let err = t
        .engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    // Rolled back before the error came back
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, None);

    t.wait_for(|event| matches!(event, EngineEvent::OperationFailed { .. }))
        .await;
    let failed = t.engine.get_sync_queue().failed_items().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 2);
    assert_eq!(t.engine.failed_operation_count(), 1);

    let metrics = t.engine.sync_metrics().await;
    assert_eq!(metrics.retried, 1);
    assert_eq!(metrics.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_listener_sees_every_change() {
    let t = TestEngine::online();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    t.engine.on_sync_queue_update(move |stats| {
        sink.lock().unwrap().push(stats.outstanding());
    });

    t.engine.initialize().await.unwrap();
    t.peer.drop_connection("flaky");
    t.settle().await;
    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();
    t.settle().await;

    assert_eq!(seen.lock().unwrap().last(), Some(&1));
}

fn operation_id(message: &ClientMessage) -> String {
    message
        .update_payload()
        .and_then(|payload| payload.operation_id.clone())
        .expect("updates carry an operation id")
}

#[tokio::test(start_paused = true)]
async fn test_drained_item_stays_queued_until_acknowledged() {
    let mut t = TestEngine::online();
    t.peer.set_auto_ack(false);
    let outcome = t
        .engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();
    let SendOutcome::Queued { item_id } = outcome else {
        panic!("expected the update to be queued, got {:?}", outcome);
    };

    t.start().await;
    t.settle().await;
    let sent = t.peer.sent_updates();
    assert_eq!(sent.len(), 1);
    assert_eq!(operation_id(&sent[0]), item_id);
    let stats = t.engine.queue_stats().await.unwrap();
    assert_eq!((stats.pending, stats.processing), (0, 1));
    assert_eq!(t.engine.in_flight_count(), 1);

    t.peer.push(ServerMessage::Ack(AckPayload {
        operation_id: item_id,
    }));
    t.wait_for_empty_queue().await;
    assert_eq!(t.engine.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_item_returns_to_queue_when_connection_drops() {
    let mut t = TestEngine::online();
    t.peer.set_auto_ack(false);
    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();
    t.start().await;
    t.settle().await;
    assert_eq!(t.peer.sent_updates().len(), 1);

    // The frame was written but the server never took it
    t.peer.drop_connection("socket reset");
    t.wait_for_status(ConnectionStatus::Reconnecting).await;

    let stats = t.engine.queue_stats().await.unwrap();
    assert_eq!((stats.pending, stats.processing), (1, 0));
    assert_eq!(t.engine.in_flight_count(), 0);
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "X"})));

    t.peer.set_auto_ack(true);
    t.peer.connect();
    t.wait_for_status(ConnectionStatus::Connected).await;
    t.wait_for_empty_queue().await;

    let sent = t.peer.sent_updates();
    assert_eq!(sent.len(), 2);
    assert_eq!(operation_id(&sent[0]), operation_id(&sent[1]));
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "X"})));
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_direct_send_is_queued_when_connection_drops() {
    let mut t = TestEngine::online();
    t.start().await;
    t.peer.set_auto_ack(false);

    let outcome = t
        .engine
        .send_project_update("p1", UpdateAction::Update, json!({"name": "Launch"}))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
    assert!(t.engine.get_sync_queue().is_empty().await.unwrap());

    t.peer.drop_connection("socket reset");
    t.wait_for_status(ConnectionStatus::Reconnecting).await;
    assert_eq!(t.engine.get_sync_queue().len().await.unwrap(), 1);

    t.peer.set_auto_ack(true);
    t.peer.connect();
    t.wait_for_status(ConnectionStatus::Connected).await;
    t.wait_for_empty_queue().await;

    let sent = t.peer.sent_updates();
    assert_eq!(sent.len(), 2);
    match &sent[1] {
        ClientMessage::ProjectUpdate(payload) => {
            assert_eq!(payload.resource_id, "p1");
            assert_eq!(payload.data, json!({"name": "Launch"}));
        }
        other => panic!("expected a project update, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_only_the_latest_unacknowledged_send_is_requeued() {
    let mut t = TestEngine::online();
    t.start().await;
    t.peer.set_auto_ack(false);

    for name in ["First", "Second"] {
        t.engine
            .send_project_update("p1", UpdateAction::Update, json!({ "name": name }))
            .await
            .unwrap();
    }

    t.peer.drop_connection("socket reset");
    t.wait_for_status(ConnectionStatus::Reconnecting).await;

    let queued = t.engine.get_sync_queue().dequeue_all().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.data, json!({"name": "Second"}));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_operation_rolls_back_direct_send() {
    let mut t = TestEngine::online();
    t.start().await;
    t.engine.subscribe_to_project("p1").await.unwrap();
    let existing = UpdatePayload::new("s1", UpdateAction::Create, json!({"title": "A"}))
        .with_project("p1")
        .with_version(1);
    t.peer.push(ServerMessage::CalendarUpdate(existing));
    t.wait_for(|event| matches!(event, EngineEvent::ResourceChanged { .. }))
        .await;

    t.peer.set_auto_ack(false);
    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Update, json!({"title": "B"}))
        .await
        .unwrap();
    let sent = t.peer.sent_updates();
    let rejected = operation_id(sent.last().expect("update sent"));

    t.peer.push(ServerMessage::Error(ServerErrorPayload {
        message: "title already taken".into(),
        status: Some(422),
        operation_id: Some(rejected),
    }));
    let event = t
        .wait_for(|event| matches!(event, EngineEvent::Error(_)))
        .await;
    assert!(matches!(event, EngineEvent::Error(ref message) if message.contains("title already taken")));

    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "A"})));
    assert_eq!(t.engine.in_flight_count(), 0);
    assert!(t.engine.get_sync_queue().is_empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_operation_fails_queued_item() {
    let mut t = TestEngine::online();
    t.peer.set_auto_ack(false);
    let outcome = t
        .engine
        .send_calendar_update("s1", "p1", UpdateAction::Create, json!({"title": "X"}))
        .await
        .unwrap();
    let SendOutcome::Queued { item_id } = outcome else {
        panic!("expected the update to be queued, got {:?}", outcome);
    };
    t.start().await;
    t.settle().await;

    t.peer.push(ServerMessage::Error(ServerErrorPayload {
        message: "calendar is read-only".into(),
        status: Some(403),
        operation_id: Some(item_id.clone()),
    }));
    let event = t
        .wait_for(|event| matches!(event, EngineEvent::OperationFailed { .. }))
        .await;
    assert!(matches!(
        event,
        EngineEvent::OperationFailed { item_id: ref failed, .. } if *failed == item_id
    ));

    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, None);
    assert_eq!(t.engine.failed_operation_count(), 1);
    assert!(t.engine.get_sync_queue().is_empty().await.unwrap());
}
