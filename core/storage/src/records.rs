//! Record families persisted by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use offsync_common::{Error, HttpMethod, Result};

/// Free-form metadata attached to every record.
pub type Metadata = Map<String, Value>;

/// Merge `patch` into `target`, overwriting existing keys.
pub fn merge_metadata(target: &mut Metadata, patch: Option<&Metadata>) {
    if let Some(patch) = patch {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        concat!("Unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle of a captured HTTP-shaped mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
}

string_enum!(TransactionStatus {
    Pending => "pending",
    Syncing => "syncing",
    Synced => "synced",
    Failed => "failed",
    Conflict => "conflict",
});

/// Entity-level operation kind of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    Read,
}

string_enum!(SyncOperation {
    Create => "create",
    Update => "update",
    Delete => "delete",
    Read => "read",
});

impl SyncOperation {
    /// Default queue priority: creates drain before dependent updates and deletes.
    pub fn default_priority(&self) -> u8 {
        match self {
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
            Self::Read => 5,
        }
    }
}

/// Lifecycle of a sync queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(SyncItemStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// Policy used to reconcile a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    ClientWins,
    ServerWins,
    Merge,
    Manual,
}

string_enum!(ResolutionStrategy {
    ClientWins => "client-wins",
    ServerWins => "server-wins",
    Merge => "merge",
    Manual => "manual",
});

/// Transaction fields supplied by the caller; the store fills in the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub max_retries: u32,
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewTransaction {
    pub fn new(method: HttpMethod, url: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            body: None,
            entity_type: entity_type.into(),
            entity_id: None,
            max_retries: 3,
            user_id: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A queued HTTP-shaped mutation captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineTransaction {
    pub id: i64,
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TransactionStatus,
    pub client_id: String,
    pub user_id: Option<String>,
    pub metadata: Metadata,
}

impl OfflineTransaction {
    pub(crate) fn from_new(
        id: i64,
        new: NewTransaction,
        client_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            url: new.url,
            method: new.method,
            headers: new.headers,
            body: new.body,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            timestamp,
            retry_count: 0,
            max_retries: new.max_retries,
            status: TransactionStatus::Pending,
            client_id: client_id.to_string(),
            user_id: new.user_id,
            metadata: new.metadata,
        }
    }
}

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineDataEntry {
    pub key: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Absolute expiry time.
    pub expires_at: DateTime<Utc>,
    pub data_type: String,
    pub version: u64,
    pub checksum: String,
    pub metadata: Metadata,
}

impl OfflineDataEntry {
    /// Whether the entry must be treated as absent at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Build the successor of `previous` holding `data`.
    ///
    /// The version only advances when the payload actually changed.
    pub(crate) fn next(
        previous: Option<&OfflineDataEntry>,
        key: &str,
        data: Value,
        data_type: &str,
        expires_at: DateTime<Utc>,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        let checksum = offsync_common::checksum(&data);
        let version = match previous {
            Some(prev) if prev.checksum == checksum => prev.version,
            Some(prev) => prev.version + 1,
            None => 1,
        };
        Self {
            key: key.to_string(),
            data,
            timestamp: now,
            expires_at,
            data_type: data_type.to_string(),
            version,
            checksum,
            metadata,
        }
    }
}

/// Queue item fields supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSyncItem {
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub data: Value,
    pub priority: u8,
    pub max_retries: u32,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewSyncItem {
    /// Create an item with the operation's default priority.
    pub fn new(operation: SyncOperation, entity_type: impl Into<String>, data: Value) -> Self {
        Self {
            operation,
            entity_type: entity_type.into(),
            entity_id: None,
            data,
            priority: operation.default_priority(),
            max_retries: 3,
            dependencies: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<i64>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A pending entity-level operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub data: Value,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    pub status: SyncItemStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<i64>,
    /// Earliest time a retried item may be attempted again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl SyncQueueItem {
    pub(crate) fn from_new(id: i64, new: NewSyncItem, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            operation: new.operation,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            data: new.data,
            priority: new.priority.clamp(1, 10),
            timestamp,
            status: SyncItemStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            dependencies: new.dependencies,
            next_attempt_at: None,
            metadata: new.metadata,
        }
    }

    /// Whether the item may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// The client's last known concurrency token, if one was captured.
    pub fn last_known_version(&self) -> Option<&Value> {
        self.metadata
            .get("lastKnownVersion")
            .filter(|value| !value.is_null())
    }
}

/// A detected divergence between client and server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub key: String,
    pub entity_type: String,
    pub entity_id: String,
    pub client_data: Value,
    pub server_data: Value,
    pub timestamp: DateTime<Utc>,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    pub resolution: Option<Value>,
    pub metadata: Metadata,
}

impl ConflictEntry {
    /// Create an unresolved conflict.
    pub fn new(
        key: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        client_data: Value,
        server_data: Value,
    ) -> Self {
        Self {
            key: key.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            client_data,
            server_data,
            timestamp: Utc::now(),
            strategy: ResolutionStrategy::Manual,
            resolved: false,
            resolution: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Record the final resolution. Both flags change together.
    pub fn mark_resolved(&mut self, strategy: ResolutionStrategy, resolution: Value) {
        self.strategy = strategy;
        self.resolution = Some(resolution);
        self.resolved = true;
    }
}

/// Per-family record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub transactions: usize,
    pub cached_entries: usize,
    pub sync_queue: usize,
    pub conflicts: usize,
    /// Best-effort on-disk (or in-memory) size; 0 when unknown.
    pub total_bytes: u64,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_entries: usize,
    pub purged_sync_items: usize,
    pub purged_conflicts: usize,
}

/// Full dump of every record family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreExport {
    pub client_id: String,
    pub exported_at: DateTime<Utc>,
    pub transactions: Vec<OfflineTransaction>,
    pub cache: Vec<OfflineDataEntry>,
    pub sync_queue: Vec<SyncQueueItem>,
    pub conflicts: Vec<ConflictEntry>,
}
