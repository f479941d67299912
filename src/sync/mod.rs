//! # Synchronization
//!
//! Conflict resolution and drain metrics.
//!
//! ## Key Components
//!
//! - `conflict_resolver.rs`: resolver registry and the built-in strategies
//! - `metrics.rs`: drain-cycle counters

pub mod conflict_resolver;
pub mod metrics;

pub use conflict_resolver::{
    ConflictResolution, ConflictResolver, FieldTransform, ResolutionStrategy, ResolverFn,
    ResolverKey, Side,
};
pub use metrics::SyncMetrics;
