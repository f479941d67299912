//! # Local Queue Store
//!
//! Durable storage behind the offline [`SyncQueue`](crate::offline::SyncQueue).
//! Offline periods can outlast the process, so queued operations live in a
//! local SQLite database rather than in memory.
//!
//! ## Key Components
//!
//! - [`QueueStore`]: the minimal put/get/delete/scan interface the queue needs
//! - [`SqliteQueueStore`]: SQLite implementation (WAL mode, indexed drain scans)
//! - [`MemoryQueueStore`]: non-durable implementation for ephemeral sessions
//! - `schema.rs`: table definitions and migration bookkeeping
//!
//! ## Usage
//!
//! ```rust,no_run
//! use schedsync::local_db::SqliteQueueStore;
//!
//! # async fn example() -> schedsync::shared::Result<()> {
//! let store = SqliteQueueStore::open("/tmp/schedsync/queue.db").await?;
//! let stats = store.get_stats().await?;
//! println!("{} queued operations", stats.total);
//! # Ok(())
//! # }
//! ```

pub mod schema;

use crate::offline::queue::{Priority, QueueItemStatus, SyncQueueItem};
use crate::shared::error::{Result, SyncError};
use crate::shared::event::UpdatePayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Minimal durable-queue interface.
///
/// Every method is atomic for a single item. `claim_next` must pick and flip
/// an item to `processing` in one step so two drain loops never claim the
/// same item.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert or overwrite an item keyed by its id
    async fn put(&self, item: &SyncQueueItem) -> Result<()>;

    /// Fetch an item by id
    async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>>;

    /// Remove an item; removing a missing id is not an error
    async fn delete(&self, id: &str) -> Result<()>;

    /// Claim the highest-priority, oldest pending item available at `now`
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<SyncQueueItem>>;

    /// Items with the given status in drain order
    async fn scan_by_status(&self, status: QueueItemStatus) -> Result<Vec<SyncQueueItem>>;

    /// Every item in drain order
    async fn scan_all(&self) -> Result<Vec<SyncQueueItem>>;

    /// Remove every item
    async fn clear(&self) -> Result<()>;
}

/// SQLite-backed queue store
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "id, operation_type, resource_kind, payload, enqueued_at, \
     retry_count, max_retries, priority, status, available_at, last_error";

impl SqliteQueueStore {
    /// Open or create the queue database at `path`
    ///
    /// Creates the parent directory and the file when missing and enables WAL
    /// mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::Storage(e.into()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!("[Queue] Opened queue database at {}", path.display());
        Ok(store)
    }

    /// In-memory SQLite database, useful for tests
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);

        // One connection keeps the memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending migrations, each in its own transaction
    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(schema::MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await?;

        let (current_version,): (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        if !schema::needs_migration(current_version) {
            return Ok(());
        }

        for migration in schema::pending_migrations(current_version) {
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.description)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::debug!(
                "[Queue] Applied schema migration {}: {}",
                migration.version,
                migration.description
            );
        }

        Ok(())
    }

    /// Applied migration versions, oldest first
    pub async fn schema_versions(&self) -> Result<Vec<i32>> {
        let versions: Vec<(i32,)> =
            sqlx::query_as("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await?;
        Ok(versions.into_iter().map(|(version,)| version).collect())
    }

    /// Count items per status
    pub async fn get_stats(&self) -> Result<StoreStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = StoreStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let count = count as u64;
            stats.total += count;
            match status.parse::<QueueItemStatus>() {
                Ok(QueueItemStatus::Pending) => stats.pending += count,
                Ok(QueueItemStatus::Processing) => stats.processing += count,
                Ok(QueueItemStatus::Failed) => stats.failed += count,
                Err(_) => tracing::warn!("[Queue] Unknown status '{}' in store", status),
            }
        }
        Ok(stats)
    }

    fn decode(row: &SqliteRow) -> Result<SyncQueueItem> {
        let payload: String = row.try_get("payload")?;
        let payload: UpdatePayload = serde_json::from_str(&payload)?;
        let operation_type: String = row.try_get("operation_type")?;
        let status: String = row.try_get("status")?;
        let resource_kind: String = row.try_get("resource_kind")?;
        let priority: i64 = row.try_get("priority")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        let max_retries: i64 = row.try_get("max_retries")?;

        Ok(SyncQueueItem {
            id: row.try_get("id")?,
            operation_type: operation_type.parse().map_err(decode_error)?,
            resource_kind: resource_kind.into(),
            payload,
            enqueued_at: from_micros(row.try_get("enqueued_at")?)?,
            retry_count: retry_count as u32,
            max_retries: max_retries as u32,
            priority: Priority::from_level(priority),
            status: status.parse().map_err(decode_error)?,
            available_at: from_micros(row.try_get("available_at")?)?,
            last_error: row.try_get("last_error")?,
        })
    }
}

fn decode_error(message: String) -> SyncError {
    SyncError::Storage(sqlx::Error::Decode(message.into()))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| decode_error(format!("timestamp out of range: {}", micros)))
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn put(&self, item: &SyncQueueItem) -> Result<()> {
        let payload = serde_json::to_string(&item.payload)?;

        // Upsert keeps the rowid, which breaks enqueued_at ties in drain order.
        sqlx::query(
            "INSERT INTO sync_queue (id, operation_type, resource_kind, payload, enqueued_at,
                retry_count, max_retries, priority, status, available_at, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                operation_type = excluded.operation_type,
                resource_kind = excluded.resource_kind,
                payload = excluded.payload,
                enqueued_at = excluded.enqueued_at,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                priority = excluded.priority,
                status = excluded.status,
                available_at = excluded.available_at,
                last_error = excluded.last_error",
        )
        .bind(&item.id)
        .bind(item.operation_type.as_str())
        .bind(item.resource_kind.as_str())
        .bind(payload)
        .bind(item.enqueued_at.timestamp_micros())
        .bind(item.retry_count as i64)
        .bind(item.max_retries as i64)
        .bind(item.priority.level())
        .bind(item.status.as_str())
        .bind(item.available_at.timestamp_micros())
        .bind(item.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM sync_queue WHERE id = ?", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<SyncQueueItem>> {
        let row = sqlx::query(&format!(
            "UPDATE sync_queue SET status = 'processing'
             WHERE id = (
                SELECT id FROM sync_queue
                WHERE status = 'pending' AND available_at <= ?
                ORDER BY priority DESC, enqueued_at ASC, rowid ASC
                LIMIT 1
             )
             RETURNING {}",
            SELECT_COLUMNS
        ))
        .bind(now.timestamp_micros())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn scan_by_status(&self, status: QueueItemStatus) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sync_queue WHERE status = ?
             ORDER BY priority DESC, enqueued_at ASC, rowid ASC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn scan_all(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sync_queue ORDER BY priority DESC, enqueued_at ASC, rowid ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Per-status item counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

/// Non-durable queue store
///
/// Keeps insertion order so equal `(priority, enqueued_at)` keys drain FIFO,
/// matching the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    items: RwLock<MemoryItems>,
}

#[derive(Debug, Default)]
struct MemoryItems {
    next_seq: u64,
    by_id: HashMap<String, (u64, SyncQueueItem)>,
}

impl MemoryItems {
    fn ordered(&self) -> Vec<&(u64, SyncQueueItem)> {
        let mut entries: Vec<_> = self.by_id.values().collect();
        entries.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(seq_a.cmp(seq_b))
        });
        entries
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn put(&self, item: &SyncQueueItem) -> Result<()> {
        let mut items = self.items.write().await;
        let seq = match items.by_id.get(&item.id) {
            Some((seq, _)) => *seq,
            None => {
                items.next_seq += 1;
                items.next_seq
            }
        };
        items.by_id.insert(item.id.clone(), (seq, item.clone()));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let items = self.items.read().await;
        Ok(items.by_id.get(id).map(|(_, item)| item.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.items.write().await.by_id.remove(id);
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<SyncQueueItem>> {
        let mut items = self.items.write().await;
        let next_id = items
            .ordered()
            .into_iter()
            .find(|(_, item)| item.status == QueueItemStatus::Pending && item.available_at <= now)
            .map(|(_, item)| item.id.clone());

        Ok(next_id.and_then(|id| {
            items.by_id.get_mut(&id).map(|(_, item)| {
                item.status = QueueItemStatus::Processing;
                item.clone()
            })
        }))
    }

    async fn scan_by_status(&self, status: QueueItemStatus) -> Result<Vec<SyncQueueItem>> {
        let items = self.items.read().await;
        Ok(items
            .ordered()
            .into_iter()
            .filter(|(_, item)| item.status == status)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn scan_all(&self) -> Result<Vec<SyncQueueItem>> {
        let items = self.items.read().await;
        Ok(items.ordered().into_iter().map(|(_, item)| item.clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.items.write().await.by_id.clear();
        Ok(())
    }
}
