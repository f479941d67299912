//! schedsync - Realtime Sync Engine
//!
//! Client-resident synchronization engine for a collaborative scheduling
//! application. It keeps local calendar and project state consistent with a
//! remote authority over an intermittent connection, and lets the user keep
//! editing while offline.
//!
//! # Overview
//!
//! - Connection lifecycle with reconnection, room membership and heartbeat latency
//! - Durable offline queue (SQLite) drained automatically on reconnect
//! - Pluggable conflict resolution keyed by resource and conflict kind
//! - Optimistic local state with confirmation, adjustment and rollback
//!
//! # Module Structure
//!
//! - **`shared`** - Wire protocol, error type and configuration
//! - **`realtime`** - Transport, connection manager and the [`RealtimeManager`] orchestrator
//! - **`offline`** - Sync queue, retry policy and optimistic [`StateSync`]
//! - **`sync`** - Conflict resolver and drain metrics
//! - **`local_db`** - Durable queue storage
//! - **`state`** - Reactive per-kind state containers
//! - **`audit`** - Security audit hooks
//!
//! # Usage
//!
//! ```rust,no_run
//! use schedsync::local_db::SqliteQueueStore;
//! use schedsync::audit::TracingAuditLogger;
//! use schedsync::offline::StateSync;
//! use schedsync::realtime::{RealtimeManager, WebSocketTransport};
//! use schedsync::shared::{EngineConfig, UpdateAction};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let engine = RealtimeManager::new(
//!     &config,
//!     Arc::new(WebSocketTransport::new(&config.server_url)?),
//!     Arc::new(SqliteQueueStore::open(&config.database_path).await?),
//!     StateSync::in_memory(config.rollback_timeout),
//!     Arc::new(TracingAuditLogger),
//! );
//!
//! engine.initialize().await?;
//! engine.subscribe_to_project("p1").await?;
//! engine
//!     .send_calendar_update("s1", "p1", UpdateAction::Create, serde_json::json!({"title": "X"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! Every component is `Send + Sync` and shared through `Arc`. Connection
//! events are handled one at a time by the engine's event task; per-resource
//! ordering of optimistic updates comes from the supersede rule in
//! [`StateSync`].

/// Security audit hooks
pub mod audit;

/// Durable queue storage
pub mod local_db;

/// Offline queue and optimistic updates
pub mod offline;

/// Connection and orchestration
pub mod realtime;

/// Shared types and configuration
pub mod shared;

/// Reactive state containers
pub mod state;

/// Conflict resolution
pub mod sync;

pub use offline::StateSync;
pub use realtime::{ConnectionStatus, EngineEvent, RealtimeManager};
pub use shared::{EngineConfig, Result, SyncError};
