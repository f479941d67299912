//! # Audit Hooks
//!
//! Security audit logging for inbound data. Hooks are fire-and-forget: they
//! return nothing and must never block or fail synchronization.
//!
//! ## Implementations
//!
//! - [`TracingAuditLogger`]: writes to the `audit` tracing target
//! - [`MemoryAuditLogger`]: keeps entries in memory for inspection

use crate::shared::event::ResourceKind;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

/// Security/audit collaborator
pub trait AuditLogger: Send + Sync {
    /// A server update touched local data
    fn log_data_access(&self, kind: &ResourceKind, resource_id: &str, action: &str);

    /// Something arrived that the session did not ask for
    fn log_suspicious_activity(&self, description: &str, resource_id: Option<&str>);
}

/// Audit logger backed by `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log_data_access(&self, kind: &ResourceKind, resource_id: &str, action: &str) {
        tracing::info!(
            target: "audit",
            kind = %kind,
            resource_id,
            action,
            "data access"
        );
    }

    fn log_suspicious_activity(&self, description: &str, resource_id: Option<&str>) {
        tracing::warn!(
            target: "audit",
            resource_id = resource_id.unwrap_or("-"),
            "suspicious activity: {}",
            description
        );
    }
}

/// One recorded audit entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEntry {
    DataAccess {
        kind: ResourceKind,
        resource_id: String,
        action: String,
        at: DateTime<Utc>,
    },
    Suspicious {
        description: String,
        resource_id: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Audit logger that records entries in memory
#[derive(Debug, Default)]
pub struct MemoryAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    /// Number of suspicious-activity entries
    pub fn suspicious_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| matches!(entry, AuditEntry::Suspicious { .. }))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log_data_access(&self, kind: &ResourceKind, resource_id: &str, action: &str) {
        self.lock().push(AuditEntry::DataAccess {
            kind: kind.clone(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            at: Utc::now(),
        });
    }

    fn log_suspicious_activity(&self, description: &str, resource_id: Option<&str>) {
        self.lock().push(AuditEntry::Suspicious {
            description: description.to_string(),
            resource_id: resource_id.map(str::to_string),
            at: Utc::now(),
        });
    }
}
