//! SQLite-backed durable store.
//!
//! One database file holds all four record families plus a small
//! `store_meta` table for the persisted client id. Timestamps are stored as
//! epoch milliseconds and JSON payloads as text.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use offsync_common::{ClientId, Error, Result};

use crate::records::{
    merge_metadata, CleanupReport, ConflictEntry, Metadata, NewSyncItem, NewTransaction,
    OfflineDataEntry, OfflineTransaction, ResolutionStrategy, StorageStats, StoreExport,
    SyncItemStatus, SyncQueueItem, TransactionStatus,
};
use crate::store::{OfflineStore, StoreConfig};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    timestamp INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    status TEXT NOT NULL,
    client_id TEXT NOT NULL,
    user_id TEXT,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_status ON offline_transactions(status, timestamp);
CREATE INDEX IF NOT EXISTS idx_transactions_entity ON offline_transactions(entity_type);

CREATE TABLE IF NOT EXISTS cached_data (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    data_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cached_expires ON cached_data(expires_at);
CREATE INDEX IF NOT EXISTS idx_cached_type ON cached_data(data_type);

CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    data TEXT NOT NULL,
    priority INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    dependencies TEXT NOT NULL,
    next_attempt_at INTEGER,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_next ON sync_queue(status, priority, timestamp);

CREATE TABLE IF NOT EXISTS conflicts (
    key TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    client_data TEXT NOT NULL,
    server_data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolution TEXT,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflicts_open ON conflicts(resolved, timestamp);
"#;

const TRANSACTION_COLUMNS: &str = "id, url, method, headers, body, entity_type, entity_id, \
     timestamp, retry_count, max_retries, status, client_id, user_id, metadata";
const ENTRY_COLUMNS: &str =
    "key, data, timestamp, expires_at, data_type, version, checksum, metadata";
const ITEM_COLUMNS: &str = "id, operation, entity_type, entity_id, data, priority, timestamp, \
     status, retry_count, max_retries, dependencies, next_attempt_at, metadata";
const CONFLICT_COLUMNS: &str = "key, entity_type, entity_id, client_data, server_data, \
     timestamp, strategy, resolved, resolution, metadata";

/// Durable store on a single SQLite database.
///
/// The connection is opened lazily by the first operation; concurrent first
/// callers share one initialization.
pub struct SqliteStore {
    path: Option<PathBuf>,
    retention: Duration,
    conn: OnceCell<Mutex<Connection>>,
}

impl SqliteStore {
    /// Store described by `config`. Nothing is opened until first use.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            path: config.path.clone(),
            retention: config.retention(),
            conn: OnceCell::new(),
        }
    }

    /// Store backed by a database file.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(&StoreConfig::at_path(path))
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Self {
        Self::new(&StoreConfig::default())
    }

    async fn connection(&self) -> Result<&Mutex<Connection>> {
        self.conn
            .get_or_try_init(|| async { self.open_connection().map(Mutex::new) })
            .await
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::StorageUnavailable(format!(
                            "Cannot create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                Connection::open(path)
            }
            None => Connection::open_in_memory(),
        }
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::StorageUnavailable(format!("Schema setup failed: {}", e)))?;

        conn.execute(
            "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('client_id', ?1)",
            params![ClientId::generate().as_str()],
        )
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        info!(
            path = %self.path.as_ref().map_or_else(|| ":memory:".into(), |p| p.display().to_string()),
            "Opened offline store"
        );
        Ok(conn)
    }

    /// Run `f` against the open connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        let conn = self.connection().await?;
        let mut guard = conn
            .lock()
            .map_err(|_| Error::Storage("store connection lock poisoned".to_string()))?;
        f(&mut guard).map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn conversion_failure(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_failure(idx, e))
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

fn metadata_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    match json_col(row, idx)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Metadata::new()),
    }
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_failure(idx, e))
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<OfflineTransaction> {
    let headers: String = row.get(3)?;
    Ok(OfflineTransaction {
        id: row.get(0)?,
        url: row.get(1)?,
        method: enum_col(row, 2)?,
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers)
            .map_err(|e| conversion_failure(3, e))?,
        body: opt_json_col(row, 4)?,
        entity_type: row.get(5)?,
        entity_id: row.get(6)?,
        timestamp: time_col(row, 7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        status: enum_col(row, 10)?,
        client_id: row.get(11)?,
        user_id: row.get(12)?,
        metadata: metadata_col(row, 13)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<OfflineDataEntry> {
    let version: i64 = row.get(5)?;
    Ok(OfflineDataEntry {
        key: row.get(0)?,
        data: json_col(row, 1)?,
        timestamp: time_col(row, 2)?,
        expires_at: time_col(row, 3)?,
        data_type: row.get(4)?,
        version: version as u64,
        checksum: row.get(6)?,
        metadata: metadata_col(row, 7)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    let dependencies: String = row.get(10)?;
    let next_attempt_at: Option<i64> = row.get(11)?;
    Ok(SyncQueueItem {
        id: row.get(0)?,
        operation: enum_col(row, 1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        data: json_col(row, 4)?,
        priority: row.get(5)?,
        timestamp: time_col(row, 6)?,
        status: enum_col(row, 7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        dependencies: serde_json::from_str(&dependencies).map_err(|e| conversion_failure(10, e))?,
        next_attempt_at: next_attempt_at.and_then(DateTime::from_timestamp_millis),
        metadata: metadata_col(row, 12)?,
    })
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictEntry> {
    Ok(ConflictEntry {
        key: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        client_data: json_col(row, 3)?,
        server_data: json_col(row, 4)?,
        timestamp: time_col(row, 5)?,
        strategy: enum_col(row, 6)?,
        resolved: row.get(7)?,
        resolution: opt_json_col(row, 8)?,
        metadata: metadata_col(row, 9)?,
    })
}

fn load_entry(conn: &Connection, key: &str) -> rusqlite::Result<Option<OfflineDataEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM cached_data WHERE key = ?1", ENTRY_COLUMNS),
        params![key],
        entry_from_row,
    )
    .optional()
}

fn load_metadata(conn: &Connection, table: &str, id: i64) -> rusqlite::Result<Option<Metadata>> {
    conn.query_row(
        &format!("SELECT metadata FROM {} WHERE id = ?1", table),
        params![id],
        |row| metadata_col(row, 0),
    )
    .optional()
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, map)?;
    rows.collect()
}

#[async_trait]
impl OfflineStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn initialize(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn client_id(&self) -> Result<ClientId> {
        let id = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM store_meta WHERE key = 'client_id'",
                    [],
                    |row| row.get::<_, String>(0),
                )
            })
            .await?;
        ClientId::new(id)
    }

    async fn store_data_at(
        &self,
        key: &str,
        data: Value,
        data_type: &str,
        ttl: Duration,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<OfflineDataEntry> {
        self.with_conn(move |conn| {
            let previous = load_entry(conn, key)?;
            let entry = OfflineDataEntry::next(
                previous.as_ref(),
                key,
                data,
                data_type,
                now + ttl,
                metadata,
                now,
            );
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO cached_data ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    ENTRY_COLUMNS
                ),
                params![
                    entry.key,
                    entry.data.to_string(),
                    millis(entry.timestamp),
                    millis(entry.expires_at),
                    entry.data_type,
                    entry.version as i64,
                    entry.checksum,
                    Value::Object(entry.metadata.clone()).to_string(),
                ],
            )?;
            Ok(entry)
        })
        .await
    }

    async fn get_entry_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<OfflineDataEntry>> {
        self.with_conn(|conn| match load_entry(conn, key)? {
            Some(entry) if entry.is_expired_at(now) => {
                conn.execute("DELETE FROM cached_data WHERE key = ?1", params![key])?;
                debug!(key, "Dropped expired cache entry");
                Ok(None)
            }
            other => Ok(other),
        })
        .await
    }

    async fn get_entries_by_type_at(
        &self,
        data_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineDataEntry>> {
        let now_ms = millis(now);
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cached_data WHERE data_type = ?1 AND expires_at < ?2",
                params![data_type, now_ms],
            )?;
            collect(
                conn,
                &format!(
                    "SELECT {} FROM cached_data WHERE data_type = ?1 ORDER BY key",
                    ENTRY_COLUMNS
                ),
                params![data_type],
                entry_from_row,
            )
        })
        .await
    }

    async fn remove_data(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cached_data WHERE key = ?1", params![key])
                .map(|n| n > 0)
        })
        .await
    }

    async fn remove_data_by_type(&self, data_type: &str) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cached_data WHERE data_type = ?1",
                params![data_type],
            )
        })
        .await
    }

    async fn store_offline_transaction(&self, txn: NewTransaction) -> Result<i64> {
        let client_id = self.client_id().await?;
        let headers = serde_json::to_string(&txn.headers)?;
        let now = millis(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO offline_transactions (url, method, headers, body, entity_type, \
                 entity_id, timestamp, retry_count, max_retries, status, client_id, user_id, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12)",
                params![
                    txn.url,
                    txn.method.as_str(),
                    headers,
                    txn.body.as_ref().map(Value::to_string),
                    txn.entity_type,
                    txn.entity_id,
                    now,
                    txn.max_retries,
                    TransactionStatus::Pending.as_str(),
                    client_id.as_str(),
                    txn.user_id,
                    Value::Object(txn.metadata).to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_transaction(&self, id: i64) -> Result<Option<OfflineTransaction>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM offline_transactions WHERE id = ?1",
                    TRANSACTION_COLUMNS
                ),
                params![id],
                transaction_from_row,
            )
            .optional()
        })
        .await
    }

    async fn get_pending_transactions(&self) -> Result<Vec<OfflineTransaction>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM offline_transactions WHERE status = ?1 ORDER BY timestamp, id",
                    TRANSACTION_COLUMNS
                ),
                params![TransactionStatus::Pending.as_str()],
                transaction_from_row,
            )
        })
        .await
    }

    async fn update_transaction_status(
        &self,
        id: i64,
        status: TransactionStatus,
        metadata_patch: Option<Metadata>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let Some(mut metadata) = load_metadata(conn, "offline_transactions", id)? else {
                return Ok(());
            };
            merge_metadata(&mut metadata, metadata_patch.as_ref());
            conn.execute(
                "UPDATE offline_transactions SET status = ?1, metadata = ?2 WHERE id = ?3",
                params![status.as_str(), Value::Object(metadata).to_string(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn bump_transaction_retry(&self, id: i64) -> Result<Option<u32>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE offline_transactions SET retry_count = retry_count + 1 WHERE id = ?1",
                params![id],
            )?;
            conn.query_row(
                "SELECT retry_count FROM offline_transactions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn add_to_sync_queue_at(&self, item: NewSyncItem, now: DateTime<Utc>) -> Result<i64> {
        let dependencies = serde_json::to_string(&item.dependencies)?;
        let now = millis(now);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sync_queue (operation, entity_type, entity_id, data, priority, \
                 timestamp, status, retry_count, max_retries, dependencies, next_attempt_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, NULL, ?10)",
                params![
                    item.operation.as_str(),
                    item.entity_type,
                    item.entity_id,
                    item.data.to_string(),
                    item.priority.clamp(1, 10),
                    now,
                    SyncItemStatus::Pending.as_str(),
                    item.max_retries,
                    dependencies,
                    Value::Object(item.metadata).to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_sync_item(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM sync_queue WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                item_from_row,
            )
            .optional()
        })
        .await
    }

    async fn get_next_sync_items(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM sync_queue WHERE status = ?1 \
                     ORDER BY priority, timestamp, id LIMIT ?2",
                    ITEM_COLUMNS
                ),
                params![SyncItemStatus::Pending.as_str(), limit],
                item_from_row,
            )
        })
        .await
    }

    async fn get_due_sync_items(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncQueueItem>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let now = millis(now);
        self.with_conn(move |conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM sync_queue WHERE status = ?1 \
                     AND (next_attempt_at IS NULL OR next_attempt_at <= ?2) \
                     ORDER BY priority, timestamp, id LIMIT ?3",
                    ITEM_COLUMNS
                ),
                params![SyncItemStatus::Pending.as_str(), now, limit],
                item_from_row,
            )
        })
        .await
    }

    async fn update_sync_item_status(
        &self,
        id: i64,
        status: SyncItemStatus,
        metadata_patch: Option<Metadata>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let Some(mut metadata) = load_metadata(conn, "sync_queue", id)? else {
                return Ok(());
            };
            merge_metadata(&mut metadata, metadata_patch.as_ref());
            conn.execute(
                "UPDATE sync_queue SET status = ?1, metadata = ?2 WHERE id = ?3",
                params![status.as_str(), Value::Object(metadata).to_string(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn bump_sync_item_retry(
        &self,
        id: i64,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>> {
        let next = next_attempt_at.map(millis);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sync_queue SET retry_count = retry_count + 1, next_attempt_at = ?1 \
                 WHERE id = ?2",
                params![next, id],
            )?;
            conn.query_row(
                "SELECT retry_count FROM sync_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn store_conflict(&self, entry: ConflictEntry) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO conflicts ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    CONFLICT_COLUMNS
                ),
                params![
                    entry.key,
                    entry.entity_type,
                    entry.entity_id,
                    entry.client_data.to_string(),
                    entry.server_data.to_string(),
                    millis(entry.timestamp),
                    entry.strategy.as_str(),
                    entry.resolved,
                    entry.resolution.as_ref().map(Value::to_string),
                    Value::Object(entry.metadata).to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_conflict(&self, key: &str) -> Result<Option<ConflictEntry>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM conflicts WHERE key = ?1", CONFLICT_COLUMNS),
                params![key],
                conflict_from_row,
            )
            .optional()
        })
        .await
    }

    async fn get_unresolved_conflicts(&self) -> Result<Vec<ConflictEntry>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {} FROM conflicts WHERE resolved = 0 ORDER BY timestamp, key",
                    CONFLICT_COLUMNS
                ),
                [],
                conflict_from_row,
            )
        })
        .await
    }

    async fn resolve_conflict(
        &self,
        key: &str,
        strategy: ResolutionStrategy,
        resolution: Value,
    ) -> Result<()> {
        let resolution = resolution.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conflicts SET strategy = ?1, resolution = ?2, resolved = 1 WHERE key = ?3",
                params![strategy.as_str(), resolution, key],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_storage_stats(&self) -> Result<StorageStats> {
        self.with_conn(|conn| {
            let count = |table: &str| -> rusqlite::Result<usize> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as usize)
            };
            let page_count: i64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .unwrap_or(0);
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .unwrap_or(0);

            Ok(StorageStats {
                transactions: count("offline_transactions")?,
                cached_entries: count("cached_data")?,
                sync_queue: count("sync_queue")?,
                conflicts: count("conflicts")?,
                total_bytes: (page_count.max(0) as u64) * (page_size.max(0) as u64),
            })
        })
        .await
    }

    async fn cleanup_expired_data_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let now_ms = millis(now);
        let cutoff = millis(now - self.retention);
        let report = self
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                let expired_entries = tx.execute(
                    "DELETE FROM cached_data WHERE expires_at < ?1",
                    params![now_ms],
                )?;
                let purged_sync_items = tx.execute(
                    "DELETE FROM sync_queue WHERE status = ?1 AND timestamp < ?2",
                    params![SyncItemStatus::Completed.as_str(), cutoff],
                )?;
                let purged_conflicts = tx.execute(
                    "DELETE FROM conflicts WHERE resolved = 1 AND timestamp < ?1",
                    params![cutoff],
                )?;
                tx.commit()?;
                Ok(CleanupReport {
                    expired_entries,
                    purged_sync_items,
                    purged_conflicts,
                })
            })
            .await?;

        debug!(
            expired = report.expired_entries,
            sync_items = report.purged_sync_items,
            conflicts = report.purged_conflicts,
            "Cleanup finished"
        );
        Ok(report)
    }

    async fn clear_all_data(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "BEGIN;
                 DELETE FROM offline_transactions;
                 DELETE FROM cached_data;
                 DELETE FROM sync_queue;
                 DELETE FROM conflicts;
                 COMMIT;",
            )
        })
        .await?;
        info!("Cleared offline store");
        Ok(())
    }

    async fn export_data(&self) -> Result<StoreExport> {
        let client_id = self.client_id().await?;
        self.with_conn(|conn| {
            Ok(StoreExport {
                client_id: client_id.to_string(),
                exported_at: Utc::now(),
                transactions: collect(
                    conn,
                    &format!(
                        "SELECT {} FROM offline_transactions ORDER BY id",
                        TRANSACTION_COLUMNS
                    ),
                    [],
                    transaction_from_row,
                )?,
                cache: collect(
                    conn,
                    &format!("SELECT {} FROM cached_data ORDER BY key", ENTRY_COLUMNS),
                    [],
                    entry_from_row,
                )?,
                sync_queue: collect(
                    conn,
                    &format!("SELECT {} FROM sync_queue ORDER BY id", ITEM_COLUMNS),
                    [],
                    item_from_row,
                )?,
                conflicts: collect(
                    conn,
                    &format!("SELECT {} FROM conflicts ORDER BY key", CONFLICT_COLUMNS),
                    [],
                    conflict_from_row,
                )?,
            })
        })
        .await
    }
}
