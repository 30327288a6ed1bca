//! Local durable store for offsync.
//!
//! Holds the four record families an offline-first client needs:
//! - captured HTTP-shaped transactions
//! - a TTL cache of read results and entity snapshots
//! - the prioritized sync queue of entity operations
//! - detected conflicts awaiting or recording resolution
//!
//! `SqliteStore` is the durable implementation; `MemoryStore` mirrors its
//! semantics for tests and ephemeral clients.

pub mod keys;
pub mod memory;
pub mod records;
pub mod sqlite;
pub mod store;

#[cfg(test)]
mod contract;

pub use memory::MemoryStore;
pub use records::{
    merge_metadata, CleanupReport, ConflictEntry, Metadata, NewSyncItem, NewTransaction,
    OfflineDataEntry, OfflineTransaction, ResolutionStrategy, StorageStats, StoreExport,
    SyncItemStatus, SyncOperation, SyncQueueItem, TransactionStatus,
};
pub use sqlite::SqliteStore;
pub use store::{OfflineStore, StoreConfig, DEFAULT_RETENTION_DAYS};
