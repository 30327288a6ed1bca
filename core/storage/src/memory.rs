//! In-memory store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use offsync_common::{ClientId, Error, Result};

use crate::records::{
    merge_metadata, CleanupReport, ConflictEntry, Metadata, NewSyncItem, NewTransaction,
    OfflineDataEntry, OfflineTransaction, ResolutionStrategy, StorageStats, StoreExport,
    SyncItemStatus, SyncQueueItem, TransactionStatus,
};
use crate::store::{OfflineStore, StoreConfig};

#[derive(Debug, Default)]
struct State {
    next_transaction_id: i64,
    next_item_id: i64,
    transactions: BTreeMap<i64, OfflineTransaction>,
    cache: BTreeMap<String, OfflineDataEntry>,
    queue: BTreeMap<i64, SyncQueueItem>,
    conflicts: BTreeMap<String, ConflictEntry>,
}

/// In-memory store.
///
/// Useful for testing and for clients that only need offline state for the
/// lifetime of the process. All data is lost on drop.
pub struct MemoryStore {
    state: RwLock<State>,
    client_id: ClientId,
    retention: Duration,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::with_config(&StoreConfig::default())
    }

    /// Create a store honoring the retention window from `config`.
    pub fn with_config(config: &StoreConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            client_id: ClientId::generate(),
            retention: config.retention(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    /// Pending items accepted by `keep`, in queue order.
    fn pending_items(
        &self,
        limit: usize,
        keep: impl Fn(&SyncQueueItem) -> bool,
    ) -> Result<Vec<SyncQueueItem>> {
        let state = self.read()?;
        let mut pending: Vec<_> = state
            .queue
            .values()
            .filter(|item| item.status == SyncItemStatus::Pending && keep(item))
            .cloned()
            .collect();
        pending.sort_by_key(|item| (item.priority, item.timestamp, item.id));
        pending.truncate(limit);
        Ok(pending)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn client_id(&self) -> Result<ClientId> {
        Ok(self.client_id.clone())
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
        let mut state = self.write()?;
        let entry = OfflineDataEntry::next(
            state.cache.get(key),
            key,
            data,
            data_type,
            now + ttl,
            metadata,
            now,
        );
        state.cache.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn get_entry_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<OfflineDataEntry>> {
        let mut state = self.write()?;
        match state.cache.get(key) {
            Some(entry) if entry.is_expired_at(now) => {
                state.cache.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn get_entries_by_type_at(
        &self,
        data_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineDataEntry>> {
        let mut state = self.write()?;
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for entry in state.cache.values().filter(|e| e.data_type == data_type) {
            if entry.is_expired_at(now) {
                expired.push(entry.key.clone());
            } else {
                live.push(entry.clone());
            }
        }
        for key in expired {
            state.cache.remove(&key);
        }
        Ok(live)
    }

    async fn remove_data(&self, key: &str) -> Result<bool> {
        Ok(self.write()?.cache.remove(key).is_some())
    }

    async fn remove_data_by_type(&self, data_type: &str) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.cache.len();
        state.cache.retain(|_, entry| entry.data_type != data_type);
        Ok(before - state.cache.len())
    }

    async fn store_offline_transaction(&self, txn: NewTransaction) -> Result<i64> {
        let mut state = self.write()?;
        state.next_transaction_id += 1;
        let id = state.next_transaction_id;
        let record = OfflineTransaction::from_new(id, txn, self.client_id.as_str(), Utc::now());
        state.transactions.insert(id, record);
        Ok(id)
    }

    async fn get_transaction(&self, id: i64) -> Result<Option<OfflineTransaction>> {
        Ok(self.read()?.transactions.get(&id).cloned())
    }

    async fn get_pending_transactions(&self) -> Result<Vec<OfflineTransaction>> {
        let state = self.read()?;
        let mut pending: Vec<_> = state
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.timestamp, t.id));
        Ok(pending)
    }

    async fn update_transaction_status(
        &self,
        id: i64,
        status: TransactionStatus,
        metadata_patch: Option<Metadata>,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some(txn) = state.transactions.get_mut(&id) {
            merge_metadata(&mut txn.metadata, metadata_patch.as_ref());
            txn.status = status;
        }
        Ok(())
    }

    async fn bump_transaction_retry(&self, id: i64) -> Result<Option<u32>> {
        let mut state = self.write()?;
        Ok(state.transactions.get_mut(&id).map(|txn| {
            txn.retry_count += 1;
            txn.retry_count
        }))
    }

    async fn add_to_sync_queue_at(&self, item: NewSyncItem, now: DateTime<Utc>) -> Result<i64> {
        let mut state = self.write()?;
        state.next_item_id += 1;
        let id = state.next_item_id;
        state.queue.insert(id, SyncQueueItem::from_new(id, item, now));
        Ok(id)
    }

    async fn get_sync_item(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        Ok(self.read()?.queue.get(&id).cloned())
    }

    async fn get_next_sync_items(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.pending_items(limit, |_| true)
    }

    async fn get_due_sync_items(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncQueueItem>> {
        self.pending_items(limit, |item| item.is_due(now))
    }

    async fn update_sync_item_status(
        &self,
        id: i64,
        status: SyncItemStatus,
        metadata_patch: Option<Metadata>,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some(item) = state.queue.get_mut(&id) {
            merge_metadata(&mut item.metadata, metadata_patch.as_ref());
            item.status = status;
        }
        Ok(())
    }

    async fn bump_sync_item_retry(
        &self,
        id: i64,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>> {
        let mut state = self.write()?;
        Ok(state.queue.get_mut(&id).map(|item| {
            item.retry_count += 1;
            item.next_attempt_at = next_attempt_at;
            item.retry_count
        }))
    }

    async fn store_conflict(&self, entry: ConflictEntry) -> Result<()> {
        self.write()?.conflicts.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn get_conflict(&self, key: &str) -> Result<Option<ConflictEntry>> {
        Ok(self.read()?.conflicts.get(key).cloned())
    }

    async fn get_unresolved_conflicts(&self) -> Result<Vec<ConflictEntry>> {
        let state = self.read()?;
        let mut open: Vec<_> = state
            .conflicts
            .values()
            .filter(|c| !c.resolved)
            .cloned()
            .collect();
        open.sort_by_key(|c| c.timestamp);
        Ok(open)
    }

    async fn resolve_conflict(
        &self,
        key: &str,
        strategy: ResolutionStrategy,
        resolution: Value,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some(conflict) = state.conflicts.get_mut(key) {
            conflict.mark_resolved(strategy, resolution);
        }
        Ok(())
    }

    async fn get_storage_stats(&self) -> Result<StorageStats> {
        let state = self.read()?;
        let total_bytes = state
            .cache
            .values()
            .filter_map(|entry| serde_json::to_vec(entry).ok())
            .chain(state.queue.values().filter_map(|item| serde_json::to_vec(item).ok()))
            .chain(
                state
                    .transactions
                    .values()
                    .filter_map(|txn| serde_json::to_vec(txn).ok()),
            )
            .chain(state.conflicts.values().filter_map(|c| serde_json::to_vec(c).ok()))
            .map(|bytes| bytes.len() as u64)
            .sum();

        Ok(StorageStats {
            transactions: state.transactions.len(),
            cached_entries: state.cache.len(),
            sync_queue: state.queue.len(),
            conflicts: state.conflicts.len(),
            total_bytes,
        })
    }

    async fn cleanup_expired_data_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - self.retention;
        let mut state = self.write()?;

        let cache_before = state.cache.len();
        state.cache.retain(|_, entry| !entry.is_expired_at(now));

        let queue_before = state.queue.len();
        state
            .queue
            .retain(|_, item| !(item.status == SyncItemStatus::Completed && item.timestamp < cutoff));

        let conflicts_before = state.conflicts.len();
        state
            .conflicts
            .retain(|_, conflict| !(conflict.resolved && conflict.timestamp < cutoff));

        Ok(CleanupReport {
            expired_entries: cache_before - state.cache.len(),
            purged_sync_items: queue_before - state.queue.len(),
            purged_conflicts: conflicts_before - state.conflicts.len(),
        })
    }

    async fn clear_all_data(&self) -> Result<()> {
        let mut state = self.write()?;
        state.transactions.clear();
        state.cache.clear();
        state.queue.clear();
        state.conflicts.clear();
        Ok(())
    }

    async fn export_data(&self) -> Result<StoreExport> {
        let state = self.read()?;
        Ok(StoreExport {
            client_id: self.client_id.to_string(),
            exported_at: Utc::now(),
            transactions: state.transactions.values().cloned().collect(),
            cache: state.cache.values().cloned().collect(),
            sync_queue: state.queue.values().cloned().collect(),
            conflicts: state.conflicts.values().cloned().collect(),
        })
    }
}
