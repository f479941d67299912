//! Shared Module
//!
//! Types shared by every engine component: the realtime wire protocol, the
//! engine error type and configuration.

/// Realtime wire protocol
pub mod event;

/// Engine error types
pub mod error;

/// Engine configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use event::{
    AckPayload, ClientMessage, ConflictEvent, ConflictKind, ResourceKind, ServerMessage,
    UpdateAction, UpdatePayload,
};
pub use error::{Result, SyncError};
pub use config::{ConfigError, EngineConfig, EngineConfigBuilder, QueueConfig, ReconnectPolicy};
