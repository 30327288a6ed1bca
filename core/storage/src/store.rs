//! Local durable store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use offsync_common::{ClientId, Result};

use crate::records::{
    CleanupReport, ConflictEntry, Metadata, NewSyncItem, NewTransaction, OfflineDataEntry,
    OfflineTransaction, ResolutionStrategy, StorageStats, StoreExport, SyncItemStatus,
    SyncQueueItem, TransactionStatus,
};

/// Completed queue items and resolved conflicts are kept this long.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Configuration shared by store implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file; `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Retention window for completed/resolved records.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

impl StoreConfig {
    /// Durable store at `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Set the retention window.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Retention as a duration.
    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Persistent, indexed store for the four offline record families.
///
/// Every operation lazily initializes the store; only a hard failure to open
/// the underlying storage is reported, as `Error::StorageUnavailable`.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Implementation name (e.g. "sqlite", "memory").
    fn name(&self) -> &str;

    /// Open the store and create its indexes if absent.
    ///
    /// # Postconditions
    /// - Safe to call repeatedly and concurrently; later calls are no-ops
    ///
    /// # Errors
    /// - `StorageUnavailable` if the underlying storage cannot be opened
    async fn initialize(&self) -> Result<()>;

    /// Identifier stamped on every transaction this store records.
    async fn client_id(&self) -> Result<ClientId>;

    // === Cached data ===

    /// Upsert a cache entry expiring `ttl` after `now`.
    ///
    /// # Postconditions
    /// - `checksum` reflects `data`
    /// - `version` advances only if the checksum changed
    async fn store_data_at(
        &self,
        key: &str,
        data: Value,
        data_type: &str,
        ttl: Duration,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<OfflineDataEntry>;

    /// Upsert a cache entry with a TTL in minutes.
    async fn store_data(
        &self,
        key: &str,
        data: Value,
        data_type: &str,
        ttl_minutes: i64,
    ) -> Result<()> {
        self.store_data_at(
            key,
            data,
            data_type,
            Duration::minutes(ttl_minutes),
            Metadata::new(),
            Utc::now(),
        )
        .await
        .map(|_| ())
    }

    /// Upsert a cache entry carrying metadata.
    async fn store_data_with_metadata(
        &self,
        key: &str,
        data: Value,
        data_type: &str,
        ttl_minutes: i64,
        metadata: Metadata,
    ) -> Result<OfflineDataEntry> {
        self.store_data_at(
            key,
            data,
            data_type,
            Duration::minutes(ttl_minutes),
            metadata,
            Utc::now(),
        )
        .await
    }

    /// Fetch a full cache entry as of `now`.
    ///
    /// # Postconditions
    /// - An entry expired at `now` is deleted and `None` is returned
    async fn get_entry_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<OfflineDataEntry>>;

    /// Fetch a full, unexpired cache entry.
    async fn get_entry(&self, key: &str) -> Result<Option<OfflineDataEntry>> {
        self.get_entry_at(key, Utc::now()).await
    }

    /// Fetch an unexpired payload as of `now`.
    async fn get_data_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Value>> {
        Ok(self.get_entry_at(key, now).await?.map(|entry| entry.data))
    }

    /// Fetch an unexpired payload.
    async fn get_data(&self, key: &str) -> Result<Option<Value>> {
        self.get_data_at(key, Utc::now()).await
    }

    /// All unexpired entries with the given data type, ordered by key.
    async fn get_entries_by_type_at(
        &self,
        data_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineDataEntry>>;

    /// All unexpired entries with the given data type.
    async fn get_entries_by_type(&self, data_type: &str) -> Result<Vec<OfflineDataEntry>> {
        self.get_entries_by_type_at(data_type, Utc::now()).await
    }

    /// Remove one entry. Returns whether it existed.
    async fn remove_data(&self, key: &str) -> Result<bool>;

    /// Remove every entry of a data type. Returns the number removed.
    async fn remove_data_by_type(&self, data_type: &str) -> Result<usize>;

    // === Offline transactions ===

    /// Record a transaction as `pending` and return its id.
    async fn store_offline_transaction(&self, txn: NewTransaction) -> Result<i64>;

    /// Fetch one transaction.
    async fn get_transaction(&self, id: i64) -> Result<Option<OfflineTransaction>>;

    /// Pending transactions, oldest first.
    async fn get_pending_transactions(&self) -> Result<Vec<OfflineTransaction>>;

    /// Overwrite status and merge metadata. No-op if `id` is absent.
    async fn update_transaction_status(
        &self,
        id: i64,
        status: TransactionStatus,
        metadata_patch: Option<Metadata>,
    ) -> Result<()>;

    /// Increment the retry counter, returning the new value (`None` if absent).
    async fn bump_transaction_retry(&self, id: i64) -> Result<Option<u32>>;

    // === Sync queue ===

    /// Enqueue an item as `pending`, stamped `now`, and return its id.
    async fn add_to_sync_queue_at(&self, item: NewSyncItem, now: DateTime<Utc>) -> Result<i64>;

    /// Enqueue an item stamped with the current time.
    async fn add_to_sync_queue(&self, item: NewSyncItem) -> Result<i64> {
        self.add_to_sync_queue_at(item, Utc::now()).await
    }

    /// Fetch one queue item.
    async fn get_sync_item(&self, id: i64) -> Result<Option<SyncQueueItem>>;

    /// Up to `limit` pending items ordered by (priority, timestamp).
    async fn get_next_sync_items(&self, limit: usize) -> Result<Vec<SyncQueueItem>>;

    /// Like `get_next_sync_items`, skipping items whose backoff ends after `now`.
    async fn get_due_sync_items(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncQueueItem>>;

    /// Overwrite status and merge metadata. No-op if `id` is absent.
    async fn update_sync_item_status(
        &self,
        id: i64,
        status: SyncItemStatus,
        metadata_patch: Option<Metadata>,
    ) -> Result<()>;

    /// Increment the retry counter and set the next attempt time.
    async fn bump_sync_item_retry(
        &self,
        id: i64,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>>;

    // === Conflicts ===

    /// Insert or replace a conflict record.
    async fn store_conflict(&self, entry: ConflictEntry) -> Result<()>;

    /// Fetch one conflict record.
    async fn get_conflict(&self, key: &str) -> Result<Option<ConflictEntry>>;

    /// Conflicts still awaiting resolution, oldest first.
    async fn get_unresolved_conflicts(&self) -> Result<Vec<ConflictEntry>>;

    /// Mark a conflict resolved with its final payload. No-op if absent.
    async fn resolve_conflict(
        &self,
        key: &str,
        strategy: ResolutionStrategy,
        resolution: Value,
    ) -> Result<()>;

    // === Maintenance ===

    /// Counts per family plus a best-effort byte estimate.
    async fn get_storage_stats(&self) -> Result<StorageStats>;

    /// Remove expired cache entries and old completed/resolved records.
    async fn cleanup_expired_data_at(&self, now: DateTime<Utc>) -> Result<CleanupReport>;

    /// Cleanup as of the current time.
    async fn cleanup_expired_data(&self) -> Result<CleanupReport> {
        self.cleanup_expired_data_at(Utc::now()).await
    }

    /// Wipe every record family.
    async fn clear_all_data(&self) -> Result<()>;

    /// Dump every record family.
    async fn export_data(&self) -> Result<StoreExport>;
}
