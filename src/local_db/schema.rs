//! Database Schema Definitions
//!
//! Ordered migrations for the queue database. Each migration runs once, in
//! its own transaction, and is recorded in [`MIGRATIONS_TABLE`].

/// Bookkeeping table listing applied migration versions
pub const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
";

/// One schema step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Every migration in version order; append, never edit
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "sync_queue table and drain indexes",
    sql: "
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY NOT NULL,
    operation_type TEXT NOT NULL,
    resource_kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    available_at INTEGER NOT NULL,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_sync_queue_priority_enqueued
    ON sync_queue (priority DESC, enqueued_at ASC);
CREATE INDEX IF NOT EXISTS idx_sync_queue_status
    ON sync_queue (status);
",
}];

/// Version the database is at once every migration has run
pub fn latest_version() -> i32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Check if database needs migration
pub fn needs_migration(current_version: i32) -> bool {
    current_version < latest_version()
}

/// Migrations newer than `current_version`, oldest first
pub fn pending_migrations(current_version: i32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |migration| migration.version > current_version)
}
