//! Conflict routing, resolution and refetch through the engine

use crate::common::{conflict, TestEngine};
use pretty_assertions::assert_eq;
use schedsync::realtime::{EngineEvent, LoopbackPeer};
use schedsync::shared::event::{FetchPayload, SnapshotPayload};
use schedsync::shared::{
    ClientMessage, ConflictKind, ResourceKind, ServerMessage, SyncError, UpdateAction,
    UpdatePayload,
};
use schedsync::sync::{ResolutionStrategy, ResolverKey};
use serde_json::{json, Value};
use std::time::Duration;

async fn connected_with(entries: &[(&str, Value)]) -> TestEngine {
    let mut t = TestEngine::online();
    t.start().await;
    t.engine.subscribe_to_project("p1").await.unwrap();
    for (id, data) in entries {
        let payload = UpdatePayload::new(*id, UpdateAction::Create, data.clone())
            .with_project("p1")
            .with_version(4);
        t.peer.push(ServerMessage::CalendarUpdate(payload));
        t.wait_for(|event| matches!(event, EngineEvent::ResourceChanged { .. }))
            .await;
    }
    t
}

/// Next message the client sends that matches `predicate`
async fn next_sent<F>(peer: &LoopbackPeer, predicate: F) -> ClientMessage
where
    F: Fn(&ClientMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match peer.recv().await {
                Some(message) if predicate(&message) => return message,
                Some(_) => {}
                None => panic!("loopback closed"),
            }
        }
    })
    .await
    .expect("client sent nothing matching")
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_time_edits_keep_later_instant() {
    let mut t = connected_with(&[
        ("s1", json!({"title": "Standup", "starts_at_utc": "2024-03-01T09:00:00Z"})),
        ("s2", json!({"title": "Review", "starts_at_utc": "2024-03-01T09:00:00Z"})),
    ])
    .await;

    for id in ["s1", "s2"] {
        t.peer.push(ServerMessage::ConflictDetected(conflict(
            ResourceKind::Calendar,
            id,
            ConflictKind::ConcurrentEdit,
            json!({"starts_at_utc": "2024-03-01T10:00:00Z"}),
            json!({"starts_at_utc": "2024-03-01T11:00:00Z"}),
        )));
    }

    for _ in 0..2 {
        let event = t
            .wait_for(|event| matches!(event, EngineEvent::ConflictResolved { .. }))
            .await;
        assert!(matches!(
            event,
            EngineEvent::ConflictResolved {
                strategy: ResolutionStrategy::OperationalTransform,
                version: 5,
                ..
            }
        ));
    }

    for (id, title) in [("s1", "Standup"), ("s2", "Review")] {
        assert_eq!(
            t.state(ResourceKind::Calendar, id).await,
            Some(json!({"title": title, "starts_at_utc": "2024-03-01T11:00:00Z"}))
        );
        assert_eq!(t.engine.state().known_version(&ResourceKind::Calendar, id).await, 5);
    }
}

#[tokio::test(start_paused = true)]
async fn test_project_conflict_merges_local_first() {
    let mut t = TestEngine::online();
    t.start().await;

    t.peer.push(ServerMessage::ConflictDetected(conflict(
        ResourceKind::Project,
        "p1",
        ConflictKind::ConcurrentEdit,
        json!({"name": "Local name", "updated_at": "2024-03-01T10:00:00Z", "metadata": {"color": "red"}}),
        json!({"name": "Server name", "updated_at": "2024-03-01T12:00:00Z", "metadata": {"icon": "star"}}),
    )));

    let event = t
        .wait_for(|event| matches!(event, EngineEvent::ConflictResolved { .. }))
        .await;
    assert!(matches!(
        event,
        EngineEvent::ConflictResolved { strategy: ResolutionStrategy::CrdtMerge, .. }
    ));
    assert_eq!(
        t.state(ResourceKind::Project, "p1").await,
        Some(json!({
            "name": "Local name",
            "updated_at": "2024-03-01T12:00:00Z",
            "metadata": {"color": "red", "icon": "star"}
        }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_identical_edits_are_not_a_conflict() {
    let mut t = connected_with(&[("s1", json!({"title": "Old"}))]).await;
    let local = json!({"title": "Same", "location": "Room 2"});
    t.engine
        .send_calendar_update("s1", "p1", UpdateAction::Update, local.clone())
        .await
        .unwrap();

    t.peer.push(ServerMessage::ConflictDetected(conflict(
        ResourceKind::Calendar,
        "s1",
        ConflictKind::ConcurrentEdit,
        local.clone(),
        json!({"title": "Same"}),
    )));
    let marker = UpdatePayload::new("s2", UpdateAction::Create, json!({"title": "Marker"}))
        .with_project("p1")
        .with_version(1);
    t.peer.push(ServerMessage::CalendarUpdate(marker));

    // Events are handled in order: a resolution would land before the marker
    let event = t
        .wait_for(|event| {
            matches!(
                event,
                EngineEvent::ConflictResolved { .. } | EngineEvent::ResourceChanged { .. }
            )
        })
        .await;
    assert!(
        matches!(event, EngineEvent::ResourceChanged { ref resource_id, .. } if resource_id == "s2"),
        "unexpected {:?}",
        event
    );

    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(local));
    assert!(t
        .engine
        .state()
        .pending_update(&ResourceKind::Calendar, "s1")
        .await
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failing_resolver_leaves_conflict_unresolved() {
    let mut t = connected_with(&[("s1", json!({"title": "Old"}))]).await;
    t.engine.resolver().register_resolver(
        ResolverKey::new(ResourceKind::Calendar, ConflictKind::from("locked")),
        |_| Err(SyncError::resolution("resource is locked")),
    );

    t.peer.push(ServerMessage::ConflictDetected(conflict(
        ResourceKind::Calendar,
        "s1",
        ConflictKind::from("locked"),
        json!({"title": "Mine"}),
        json!({"title": "Theirs"}),
    )));

    let event = t
        .wait_for(|event| matches!(event, EngineEvent::Error(_)))
        .await;
    assert!(matches!(event, EngineEvent::Error(ref message) if message.contains("locked")));
    // Server version was not applied
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "Old"})));
    assert_eq!(t.engine.state().known_version(&ResourceKind::Calendar, "s1").await, 4);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_kind_falls_back_to_last_write_wins() {
    let mut t = connected_with(&[("s1", json!({"title": "Old", "room": "A"}))]).await;

    t.peer.push(ServerMessage::ConflictDetected(conflict(
        ResourceKind::Calendar,
        "s1",
        ConflictKind::from("permission_change"),
        json!({"title": "Mine"}),
        json!({"title": "Theirs"}),
    )));

    let event = t
        .wait_for(|event| matches!(event, EngineEvent::ConflictResolved { .. }))
        .await;
    assert!(matches!(
        event,
        EngineEvent::ConflictResolved { strategy: ResolutionStrategy::LastWriteWins, version: 5, .. }
    ));
    assert_eq!(
        t.state(ResourceKind::Calendar, "s1").await,
        Some(json!({"title": "Theirs", "room": "A"}))
    );
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_fetches_and_reapplies_local_edits() {
    let mut t = connected_with(&[("s1", json!({"title": "Old", "room": "A"}))]).await;
    t.peer.clear_sent();

    // Two reports before the snapshot arrives: one fetch
    for _ in 0..2 {
        t.peer.push(ServerMessage::ConflictDetected(conflict(
            ResourceKind::Calendar,
            "s1",
            ConflictKind::VersionMismatch,
            json!({"title": "Mine"}),
            json!({"title": "Theirs"}),
        )));
    }

    let fetch = next_sent(&t.peer, |m| matches!(m, ClientMessage::Fetch(_))).await;
    assert_eq!(
        fetch,
        ClientMessage::Fetch(FetchPayload {
            resource_kind: ResourceKind::Calendar,
            resource_id: "s1".into(),
        })
    );

    t.peer.push(ServerMessage::Snapshot(SnapshotPayload {
        resource_kind: ResourceKind::Calendar,
        resource_id: "s1".into(),
        data: json!({"title": "Theirs", "room": "B"}),
        version: 6,
    }));

    let reapplied = next_sent(&t.peer, |m| matches!(m, ClientMessage::CalendarUpdate(_))).await;
    let ClientMessage::CalendarUpdate(payload) = reapplied else {
        unreachable!()
    };
    assert_eq!(payload.version, 6);
    assert_eq!(payload.data, json!({"title": "Mine", "room": "B"}));
    // Still routed to the project the entry belongs to
    assert_eq!(payload.project_id.as_deref(), Some("p1"));
    assert_eq!(
        t.state(ResourceKind::Calendar, "s1").await,
        Some(json!({"title": "Mine", "room": "B"}))
    );

    let fetches = t
        .peer
        .sent()
        .into_iter()
        .filter(|m| matches!(m, ClientMessage::Fetch(_)))
        .count();
    assert_eq!(fetches, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_server_update_is_ignored() {
    let mut t = connected_with(&[("s1", json!({"title": "Current"}))]).await;

    let stale = UpdatePayload::new("s1", UpdateAction::Update, json!({"title": "Ancient"}))
        .with_project("p1")
        .with_version(2);
    t.peer.push(ServerMessage::CalendarUpdate(stale));
    let newer = UpdatePayload::new("s2", UpdateAction::Create, json!({"title": "Marker"}))
        .with_project("p1")
        .with_version(1);
    t.peer.push(ServerMessage::CalendarUpdate(newer));

    let event = t
        .wait_for(|event| matches!(event, EngineEvent::ResourceChanged { .. }))
        .await;
    assert!(matches!(event, EngineEvent::ResourceChanged { ref resource_id, .. } if resource_id == "s2"));
    assert_eq!(t.state(ResourceKind::Calendar, "s1").await, Some(json!({"title": "Current"})));
}
