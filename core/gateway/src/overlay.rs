//! Optimistic local state layered over cached reads.

use serde_json::{json, Value};

use offsync_remote::{row_id, Query};
use offsync_storage::keys::{DELETED_FLAG, PENDING_FLAG, QUEUE_ID_FIELD};
use offsync_storage::{Metadata, OfflineDataEntry};

/// Metadata marking a snapshot as written by queue item `queue_id`.
pub fn pending_metadata(queue_id: i64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(PENDING_FLAG.into(), json!(true));
    metadata.insert(QUEUE_ID_FIELD.into(), json!(queue_id));
    metadata
}

/// Pending metadata plus the tombstone flag.
pub fn tombstone_metadata(queue_id: i64) -> Metadata {
    let mut metadata = pending_metadata(queue_id);
    metadata.insert(DELETED_FLAG.into(), json!(true));
    metadata
}

pub fn is_pending(metadata: &Metadata) -> bool {
    flag(metadata, PENDING_FLAG)
}

pub fn is_tombstone(metadata: &Metadata) -> bool {
    flag(metadata, DELETED_FLAG)
}

fn flag(metadata: &Metadata, name: &str) -> bool {
    metadata.get(name).and_then(Value::as_bool).unwrap_or(false)
}

/// Shallow-merge `patch` over `current`.
///
/// Idempotent: merging the same patch twice equals merging it once.
pub fn merge_patch(current: Option<&Value>, patch: &Value) -> Value {
    match (current, patch) {
        (Some(Value::Object(current)), Value::Object(patch)) => {
            let mut merged = current.clone();
            for (key, value) in patch {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

/// Apply pending entity snapshots to a cached result set.
///
/// Tombstoned rows disappear. A row with a pending snapshot is replaced by
/// it while the snapshot still matches the query's filters and dropped
/// otherwise; pending rows unknown to the result are appended when they
/// match. Settled snapshots are ignored.
pub fn apply_overlay(rows: Vec<Value>, snapshots: &[OfflineDataEntry], query: &Query) -> Vec<Value> {
    let mut rows = rows;
    let mut changed = false;

    for snapshot in snapshots.iter().filter(|s| is_pending(&s.metadata)) {
        let Some(id) = row_id(&snapshot.data) else {
            continue;
        };
        let position = rows
            .iter()
            .position(|row| row_id(row).as_deref() == Some(id.as_str()));

        if is_tombstone(&snapshot.metadata) {
            if let Some(index) = position {
                rows.remove(index);
                changed = true;
            }
            continue;
        }

        let matches = query.matches(&snapshot.data);
        match position {
            Some(index) if matches => rows[index] = query.project(snapshot.data.clone()),
            // The pending edit moved the row out of the filter.
            Some(index) => {
                rows.remove(index);
            }
            None if matches => rows.push(query.project(snapshot.data.clone())),
            None => continue,
        }
        changed = true;
    }

    if changed {
        query.sort(&mut rows);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use offsync_storage::keys::pending_owner;
    use proptest::prelude::*;

    fn snapshot(data: Value, metadata: Metadata) -> OfflineDataEntry {
        OfflineDataEntry {
            key: format!("entity:products:{}", row_id(&data).unwrap_or_default()),
            data,
            timestamp: Utc::now(),
            expires_at: Utc::now(),
            data_type: "entity:products".to_string(),
            version: 1,
            checksum: String::new(),
            metadata,
        }
    }

    #[test]
    fn test_overlay_replaces_appends_and_removes() {
        let query = Query::new("products").order("name", true);
        let rows = vec![
            json!({"id": 1, "name": "Coffee"}),
            json!({"id": 2, "name": "Tea"}),
            json!({"id": 3, "name": "Water"}),
        ];
        let snapshots = vec![
            snapshot(json!({"id": 1, "name": "Cocoa"}), pending_metadata(1)),
            snapshot(json!({"id": 3, "name": "Water"}), tombstone_metadata(2)),
            snapshot(json!({"id": "local-a", "name": "Juice"}), pending_metadata(3)),
            snapshot(json!({"id": 2, "name": "Stale"}), Metadata::new()),
        ];

        let result = apply_overlay(rows, &snapshots, &query);
        let names: Vec<_> = result.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Cocoa", "Juice", "Tea"]);
    }

    #[test]
    fn test_overlay_respects_filters() {
        let query = Query::new("products").eq("category", "drinks");
        let snapshots = vec![snapshot(
            json!({"id": "local-b", "category": "food"}),
            pending_metadata(1),
        )];
        assert!(apply_overlay(Vec::new(), &snapshots, &query).is_empty());
    }

    #[test]
    fn test_pending_edit_moves_row_out_of_filter() {
        let query = Query::new("products").eq("category", "drinks");
        let rows = vec![
            json!({"id": 1, "category": "drinks", "name": "Tea"}),
            json!({"id": 2, "category": "drinks", "name": "Coffee"}),
        ];
        let snapshots = vec![snapshot(
            json!({"id": 1, "category": "food", "name": "Tea"}),
            pending_metadata(4),
        )];

        let result = apply_overlay(rows, &snapshots, &query);
        assert_eq!(result, vec![json!({"id": 2, "category": "drinks", "name": "Coffee"})]);
    }

    #[test]
    fn test_pending_owner() {
        assert_eq!(pending_owner(&pending_metadata(7)), Some(7));
        assert_eq!(pending_owner(&Metadata::new()), None);
        assert!(is_tombstone(&tombstone_metadata(1)));
    }

    proptest! {
        #[test]
        fn prop_merge_patch_is_idempotent(
            base in proptest::collection::btree_map("[a-d]", 0i64..5, 0..4),
            patch in proptest::collection::btree_map("[a-d]", 0i64..5, 0..4),
        ) {
            let base = json!(base);
            let patch = json!(patch);
            let once = merge_patch(Some(&base), &patch);
            let twice = merge_patch(Some(&once), &patch);
            prop_assert_eq!(once, twice);
        }
    }
}
