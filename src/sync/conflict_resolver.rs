//! # Conflict Resolution System
//!
//! Turns a server-reported [`ConflictEvent`] into a [`ConflictResolution`].
//! Resolvers are registered per `(resource kind, conflict kind)` so new
//! resource kinds plug in without touching the core.
//!
//! ## Features
//!
//! - **Last Write Wins**: Server state stands (fallback for unregistered keys)
//! - **Operational Transforms**: Field-level decisions for calendar entries
//! - **CRDT Merge**: Local-biased recursive merge for projects
//! - **Refetch**: `version_mismatch` asks the caller to fetch authoritative state
//!
//! Every resolution gets `resulting_version = max(local, server) + 1`,
//! whichever resolver produced it.
//!
//! ## Usage
//!
//! ```rust
//! use schedsync::sync::{ConflictResolver, ResolutionStrategy};
//! use schedsync::shared::{ConflictEvent, ConflictKind, ResourceKind};
//! use serde_json::json;
//!
//! let resolver = ConflictResolver::new();
//! let event = ConflictEvent {
//!     resource_kind: ResourceKind::Calendar,
//!     resource_id: "s1".into(),
//!     conflict_kind: ConflictKind::ConcurrentEdit,
//!     local_version: 3,
//!     server_version: 5,
//!     local_changes: json!({"title": "Mine"}).as_object().unwrap().clone(),
//!     server_changes: json!({"title": "Theirs"}).as_object().unwrap().clone(),
//! };
//!
//! let resolution = resolver.resolve_conflict(&event).unwrap().unwrap();
//! assert_eq!(resolution.strategy, ResolutionStrategy::OperationalTransform);
//! assert_eq!(resolution.resulting_version, 6);
//! ```

use crate::shared::error::{Result, SyncError};
use std::panic::{self, AssertUnwindSafe};
use crate::shared::event::{ConflictEvent, ConflictKind, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// How a conflict was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    OperationalTransform,
    CrdtMerge,
}

/// Side whose value a transform kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Server,
}

/// One field-level decision of an operational transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: String,
    pub kept: Side,
    pub value: Value,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    /// Always `max(local_version, server_version) + 1`
    pub resulting_version: u64,
    pub timestamp: DateTime<Utc>,
    /// Fields to write into local state; `None` means the server state stands
    pub merged_data: Option<Map<String, Value>>,
    /// Field decisions, for diagnostics
    #[serde(default)]
    pub transforms: Vec<FieldTransform>,
    /// Local state cannot be merged safely; authoritative state must be fetched
    #[serde(default)]
    pub needs_refetch: bool,
}

impl ConflictResolution {
    /// A resolution with no merged data
    pub fn server_wins(event: &ConflictEvent) -> Self {
        Self {
            strategy: ResolutionStrategy::LastWriteWins,
            resulting_version: resulting_version(event),
            timestamp: Utc::now(),
            merged_data: None,
            transforms: Vec::new(),
            needs_refetch: false,
        }
    }
}

/// Version every resolution advances to
pub fn resulting_version(event: &ConflictEvent) -> u64 {
    event.local_version.max(event.server_version).saturating_add(1)
}

/// A pluggable resolver
pub type ResolverFn = Arc<dyn Fn(&ConflictEvent) -> Result<ConflictResolution> + Send + Sync>;

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolverKey {
    pub resource_kind: ResourceKind,
    pub conflict_kind: ConflictKind,
}

impl ResolverKey {
    pub fn new(resource_kind: ResourceKind, conflict_kind: ConflictKind) -> Self {
        Self {
            resource_kind,
            conflict_kind,
        }
    }
}

/// Conflict resolution manager
pub struct ConflictResolver {
    resolvers: RwLock<HashMap<ResolverKey, ResolverFn>>,
    fallback: ResolverFn,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<ResolverKey> = self
            .resolvers
            .read()
            .map(|resolvers| resolvers.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ConflictResolver").field("keys", &keys).finish()
    }
}

impl ConflictResolver {
    /// Resolver with the built-in strategies registered
    pub fn new() -> Self {
        let resolver = Self::empty();
        resolver.register_resolver(
            ResolverKey::new(ResourceKind::Calendar, ConflictKind::ConcurrentEdit),
            operational_transform,
        );
        resolver.register_resolver(
            ResolverKey::new(ResourceKind::Project, ConflictKind::ConcurrentEdit),
            crdt_merge,
        );
        for kind in [ResourceKind::Calendar, ResourceKind::Project] {
            resolver.register_resolver(
                ResolverKey::new(kind, ConflictKind::VersionMismatch),
                refetch,
            );
        }
        resolver
    }

    /// Resolver with nothing registered; everything falls back to last-write-wins
    pub fn empty() -> Self {
        Self {
            resolvers: RwLock::new(HashMap::new()),
            fallback: Arc::new(last_write_wins),
        }
    }

    /// Register (or replace) the resolver for `key`
    pub fn register_resolver<F>(&self, key: ResolverKey, resolver: F)
    where
        F: Fn(&ConflictEvent) -> Result<ConflictResolution> + Send + Sync + 'static,
    {
        tracing::debug!(
            "[Conflict] Registered resolver for ({}, {})",
            key.resource_kind,
            key.conflict_kind
        );
        self.resolvers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, Arc::new(resolver));
    }

    /// Whether a resolver is registered for exactly `key`
    pub fn has_resolver(&self, key: &ResolverKey) -> bool {
        self.resolvers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(key)
    }

    /// Resolve a conflict.
    ///
    /// Returns `Ok(None)` when no field genuinely diverges, so no resolver
    /// runs. A resolver that fails or panics yields [`SyncError::Resolution`]
    /// and the conflict stays unresolved.
    pub fn resolve_conflict(&self, event: &ConflictEvent) -> Result<Option<ConflictResolution>> {
        let refetch_required = event.conflict_kind == ConflictKind::VersionMismatch;
        if !refetch_required && !event.has_divergence() {
            tracing::debug!(
                "[Conflict] {} {} has no divergent fields, nothing to resolve",
                event.resource_kind,
                event.resource_id
            );
            return Ok(None);
        }

        let key = ResolverKey::new(event.resource_kind.clone(), event.conflict_kind.clone());
        let resolver = self
            .resolvers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| resolver(event))).unwrap_or_else(|_| {
            Err(SyncError::resolution(format!(
                "resolver for ({}, {}) panicked",
                event.resource_kind, event.conflict_kind
            )))
        });
        let mut resolution = outcome.map_err(|e| {
            tracing::error!(
                "[Conflict] Resolver for ({}, {}) failed on {}: {}",
                event.resource_kind,
                event.conflict_kind,
                event.resource_id,
                e
            );
            match e {
                SyncError::Resolution { .. } => e,
                other => SyncError::resolution(other.to_string()),
            }
        })?;

        resolution.resulting_version = resulting_version(event);
        resolution.timestamp = Utc::now();

        tracing::info!(
            "[Conflict] Resolved {} {} with {:?} at version {}",
            event.resource_kind,
            event.resource_id,
            resolution.strategy,
            resolution.resulting_version
        );
        Ok(Some(resolution))
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Server state stands
pub fn last_write_wins(event: &ConflictEvent) -> Result<ConflictResolution> {
    Ok(ConflictResolution::server_wins(event))
}

/// Version mismatch: the client must refetch before anything can be merged
pub fn refetch(event: &ConflictEvent) -> Result<ConflictResolution> {
    Ok(ConflictResolution {
        needs_refetch: true,
        ..ConflictResolution::server_wins(event)
    })
}

/// Calendar fields where the chronologically later value wins
const TIME_FIELDS: &[&str] = &["starts_at_utc", "ends_at_utc"];

/// Field-level transform for schedule-like resources.
///
/// Divergent `title` edits keep the server's value, divergent start/end
/// times keep the later instant, any other divergent field keeps the
/// server's value. Fields changed on one side only pass through.
pub fn operational_transform(event: &ConflictEvent) -> Result<ConflictResolution> {
    let mut merged = event.server_changes.clone();
    let mut transforms = Vec::new();

    for (field, local) in &event.local_changes {
        let Some(server) = event.server_changes.get(field) else {
            merged.insert(field.clone(), local.clone());
            continue;
        };
        if server == local {
            continue;
        }

        let kept = if TIME_FIELDS.contains(&field.as_str()) {
            later_of(local, server)
        } else {
            Side::Server
        };
        let value = match kept {
            Side::Local => local.clone(),
            Side::Server => server.clone(),
        };
        merged.insert(field.clone(), value.clone());
        transforms.push(FieldTransform {
            field: field.clone(),
            kept,
            value,
        });
    }

    Ok(ConflictResolution {
        strategy: ResolutionStrategy::OperationalTransform,
        merged_data: Some(merged),
        transforms,
        ..ConflictResolution::server_wins(event)
    })
}

/// Which side holds the later instant. Unparseable values compare as
/// strings; ties keep the server's.
fn later_of(local: &Value, server: &Value) -> Side {
    let parse = |value: &Value| {
        value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    let local_is_later = match (parse(local), parse(server)) {
        (Some(l), Some(s)) => l > s,
        _ => match (local.as_str(), server.as_str()) {
            (Some(l), Some(s)) => l > s,
            _ => local.as_i64().zip(server.as_i64()).map_or(false, |(l, s)| l > s),
        },
    };

    if local_is_later {
        Side::Local
    } else {
        Side::Server
    }
}

/// Field that always takes the server's value in a CRDT merge
const SERVER_CLOCK_FIELD: &str = "updated_at";

/// Local-biased merge for project-like resources.
///
/// Local changes win field by field, `updated_at` always comes from the
/// server, and nested maps present on both sides merge recursively.
pub fn crdt_merge(event: &ConflictEvent) -> Result<ConflictResolution> {
    let mut merged = merge_maps(&event.local_changes, &event.server_changes);
    if let Some(server_clock) = event.server_changes.get(SERVER_CLOCK_FIELD) {
        merged.insert(SERVER_CLOCK_FIELD.to_string(), server_clock.clone());
    }

    Ok(ConflictResolution {
        strategy: ResolutionStrategy::CrdtMerge,
        merged_data: Some(merged),
        ..ConflictResolution::server_wins(event)
    })
}

fn merge_maps(local: &Map<String, Value>, server: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = server.clone();
    for (field, local_value) in local {
        let value = match (local_value, server.get(field)) {
            (Value::Object(l), Some(Value::Object(s))) => Value::Object(merge_maps(l, s)),
            _ => local_value.clone(),
        };
        merged.insert(field.clone(), value);
    }
    merged
}
