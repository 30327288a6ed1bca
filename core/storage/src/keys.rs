//! Cache key conventions shared by the gateway and the sync engine.
//!
//! Query results live under `query:<shape>` with data type `query:<table>`;
//! entity snapshots live under `entity:<table>:<id>` with data type
//! `entity:<table>`. Keeping the table in the data type lets a whole table's
//! cached queries be invalidated through the type index.

use serde_json::Value;

use crate::records::Metadata;

/// Metadata flag set on snapshots that carry unsynced local changes.
pub const PENDING_FLAG: &str = "pending";
/// Metadata flag set on snapshots deleted while offline.
pub const DELETED_FLAG: &str = "deleted";
/// Metadata field holding the queue item that produced a snapshot.
pub const QUEUE_ID_FIELD: &str = "queueId";

/// Key of an entity snapshot.
pub fn entity_key(table: &str, id: &str) -> String {
    format!("entity:{}:{}", table, id)
}

/// Data type tag of a table's entity snapshots.
pub fn entity_type(table: &str) -> String {
    format!("entity:{}", table)
}

/// Data type tag of a table's cached query results.
pub fn query_type(table: &str) -> String {
    format!("query:{}", table)
}

/// Prefix used for ids assigned to rows created while offline.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Whether an id was assigned locally and is unknown to the server.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Queue item owning a snapshot, if the snapshot carries a pending write.
pub fn pending_owner(metadata: &Metadata) -> Option<i64> {
    let pending = metadata
        .get(PENDING_FLAG)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if pending {
        metadata.get(QUEUE_ID_FIELD).and_then(Value::as_i64)
    } else {
        None
    }
}
