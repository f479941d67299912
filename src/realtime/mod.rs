//! # Realtime Synchronization
//!
//! Connection lifecycle and the engine orchestrator.
//!
//! ## Key Components
//!
//! - `transport.rs`: the [`Transport`] seam, WebSocket and loopback implementations
//! - `heartbeat.rs`: single-flight ping/pong latency tracking
//! - `connection.rs`: [`ConnectionManager`], status machine, rooms and metrics
//! - `manager.rs`: [`RealtimeManager`], the public entry point
//!
//! ## Flow
//!
//! ```text
//! local mutation -> RealtimeManager -> StateSync (optimistic)
//!                                   -> ConnectionManager (connected)
//!                                   -> SyncQueue (offline)
//! server message -> ConnectionManager -> RealtimeManager -> ConflictResolver?
//!                                                        -> StateSync
//! ```

pub mod connection;
pub mod heartbeat;
pub mod manager;
pub mod transport;

// Re-export main types
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionMetrics, ConnectionStatus};
pub use heartbeat::{HeartbeatMonitor, HeartbeatTick};
pub use manager::{DrainReport, EngineEvent, ListenerId, RealtimeManager, SendOutcome};
pub use transport::{
    LoopbackPeer, LoopbackTransport, SendFailure, Transport, TransportEvent, WebSocketTransport,
};
