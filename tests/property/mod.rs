//! Property-based tests for conflict versions and optimistic state

use proptest::prelude::*;
use schedsync::offline::StateSync;
use schedsync::shared::{ConflictEvent, ConflictKind, ResourceKind, UpdateAction, UpdatePayload};
use schedsync::sync::ConflictResolver;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

fn kinds() -> impl Strategy<Value = (ResourceKind, ConflictKind)> {
    prop_oneof![
        Just((ResourceKind::Calendar, ConflictKind::ConcurrentEdit)),
        Just((ResourceKind::Project, ConflictKind::ConcurrentEdit)),
        Just((ResourceKind::Calendar, ConflictKind::VersionMismatch)),
        Just((ResourceKind::from("task"), ConflictKind::ConcurrentEdit)),
    ]
}

fn fields(prefix: &'static str) -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-d]", 0u32..5, 1..4).prop_map(move |values| {
        values
            .into_iter()
            .map(|(field, n)| (field, json!(format!("{}{}", prefix, n))))
            .collect()
    })
}

proptest! {
    #[test]
    fn test_resolution_version_is_max_plus_one(
        (resource_kind, conflict_kind) in kinds(),
        local_version in 0u64..1_000_000,
        server_version in 0u64..1_000_000,
        mut local_changes in fields("local-"),
        mut server_changes in fields("server-"),
    ) {
        // Guarantee at least one divergent field
        local_changes.insert("title".into(), json!("mine"));
        server_changes.insert("title".into(), json!("theirs"));
        let event = ConflictEvent {
            resource_kind,
            resource_id: "r1".into(),
            conflict_kind,
            local_version,
            server_version,
            local_changes,
            server_changes,
        };

        let resolution = ConflictResolver::new().resolve_conflict(&event).unwrap().unwrap();
        prop_assert_eq!(resolution.resulting_version, local_version.max(server_version) + 1);
    }

    #[test]
    fn test_at_most_one_pending_update_per_resource(
        ops in prop::collection::vec((0usize..3, 0u32..100), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let ids = ["a", "b", "c"];
            let sync = StateSync::in_memory(Duration::from_secs(30));
            let mut latest: HashMap<&str, Value> = HashMap::new();

            for (index, n) in ops {
                let id = ids[index];
                let data = json!({"title": format!("t{}", n)});
                let payload = UpdatePayload::new(id, UpdateAction::Update, data.clone());
                sync.apply_optimistic_update(&ResourceKind::Calendar, &payload).await.unwrap();
                latest.insert(id, data);

                prop_assert_eq!(sync.pending_count().await, latest.len());
                let pending = sync.pending_update(&ResourceKind::Calendar, id).await.unwrap();
                prop_assert_eq!(pending.proposed_snapshot.as_ref(), latest.get(id));
                // Superseded updates keep the state from before the first one
                prop_assert_eq!(pending.original_snapshot, None);
            }

            for id in latest.keys() {
                prop_assert!(sync.rollback_optimistic_update(&ResourceKind::Calendar, id).await.unwrap());
                prop_assert_eq!(sync.get_state(&ResourceKind::Calendar, id).await, None);
            }
            prop_assert_eq!(sync.pending_count().await, 0);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
