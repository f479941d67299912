//! Common test utilities and helpers
//!
//! Builds engines wired to a loopback transport and waits on engine events.

use schedsync::audit::MemoryAuditLogger;
use schedsync::local_db::{MemoryQueueStore, QueueStore};
use schedsync::offline::StateSync;
use schedsync::realtime::{
    ConnectionStatus, EngineEvent, LoopbackPeer, LoopbackTransport, RealtimeManager,
};
use schedsync::shared::{ConflictEvent, ConflictKind, EngineConfig, ResourceKind};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Engine under test plus the server side of its transport
pub struct TestEngine {
    pub engine: Arc<RealtimeManager>,
    pub peer: LoopbackPeer,
    pub audit: Arc<MemoryAuditLogger>,
    pub events: broadcast::Receiver<EngineEvent>,
    accepting: bool,
}

impl TestEngine {
    /// Default config, in-memory queue, peer refusing connections until
    /// told otherwise
    pub fn offline() -> Self {
        Self::with_store(EngineConfig::default(), Arc::new(MemoryQueueStore::new()), false)
    }

    /// Default config, in-memory queue, peer accepting connections
    pub fn online() -> Self {
        Self::with_store(EngineConfig::default(), Arc::new(MemoryQueueStore::new()), true)
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn QueueStore>, accepting: bool) -> Self {
        let (transport, peer) = LoopbackTransport::pair();
        peer.set_accepting(accepting);
        let audit = Arc::new(MemoryAuditLogger::new());
        let engine = RealtimeManager::new(
            &config,
            Arc::new(transport),
            store,
            StateSync::in_memory(config.rollback_timeout),
            audit.clone(),
        );
        let events = engine.subscribe();
        Self {
            engine,
            peer,
            audit,
            events,
            accepting,
        }
    }

    /// Initialize and wait for the first status the peer allows
    pub async fn start(&mut self) {
        self.engine.initialize().await.expect("initialize");
        let wanted = if self.accepting {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Error
        };
        self.wait_for_status(wanted).await;
    }

    pub async fn wait_for_status(&mut self, wanted: ConnectionStatus) {
        self.wait_for(|event| {
            matches!(event, EngineEvent::StatusChanged { current, .. } if *current == wanted)
        })
        .await;
    }

    /// Wait (in test time) for the first event matching `predicate`
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(600), async move {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("engine event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    /// Let spawned tasks run without moving past any timer of interest
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// Wait (in test time) until every queued item has been acknowledged
    pub async fn wait_for_empty_queue(&self) {
        let queue = self.engine.get_sync_queue();
        tokio::time::timeout(Duration::from_secs(600), async {
            while !queue.is_empty().await.expect("queue readable") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for the queue to empty")
    }

    pub async fn state(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.engine.state().get_state(&kind, id).await
    }
}

pub fn changes(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn conflict(
    kind: ResourceKind,
    resource_id: &str,
    conflict_kind: ConflictKind,
    local: Value,
    server: Value,
) -> ConflictEvent {
    ConflictEvent {
        resource_kind: kind,
        resource_id: resource_id.to_string(),
        conflict_kind,
        local_version: 3,
        server_version: 4,
        local_changes: changes(local),
        server_changes: changes(server),
    }
}
