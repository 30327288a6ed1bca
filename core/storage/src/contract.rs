//! Behavior every `OfflineStore` implementation must share.

use chrono::{Duration, Utc};
use serde_json::json;

use offsync_common::HttpMethod;

use crate::records::*;
use crate::store::OfflineStore;

pub(crate) async fn run_all(store: &dyn OfflineStore) {
    store.initialize().await.unwrap();
    cache_ttl(store).await;
    cache_versioning(store).await;
    cache_by_type(store).await;
    transactions_fifo(store).await;
    queue_priority(store).await;
    queue_timestamp_and_backoff(store).await;
    queue_retry(store).await;
    conflicts_lifecycle(store).await;
    cleanup_retention(store).await;
    stats_and_export(store).await;
    store.clear_all_data().await.unwrap();
    assert_eq!(store.get_storage_stats().await.unwrap().cached_entries, 0);
}

async fn cache_ttl(store: &dyn OfflineStore) {
    let now = Utc::now();
    store
        .store_data_at("ttl", json!([1, 2]), "query:t", Duration::minutes(60), Metadata::new(), now)
        .await
        .unwrap();

    assert_eq!(
        store.get_data_at("ttl", now + Duration::minutes(59)).await.unwrap(),
        Some(json!([1, 2]))
    );
    assert_eq!(
        store.get_data_at("ttl", now + Duration::minutes(61)).await.unwrap(),
        None
    );
    // The expired read removed the entry.
    assert!(store.get_entry_at("ttl", now).await.unwrap().is_none());
    assert!(!store.remove_data("ttl").await.unwrap());
}

async fn cache_versioning(store: &dyn OfflineStore) {
    let first = store
        .store_data_with_metadata("ver", json!({"a": 1}), "entity:t", 60, Metadata::new())
        .await
        .unwrap();
    assert_eq!(first.version, 1);

    let same = store
        .store_data_with_metadata("ver", json!({"a": 1}), "entity:t", 60, Metadata::new())
        .await
        .unwrap();
    assert_eq!(same.version, 1);
    assert_eq!(same.checksum, first.checksum);

    let mut metadata = Metadata::new();
    metadata.insert("pending".into(), json!(true));
    let changed = store
        .store_data_with_metadata("ver", json!({"a": 2}), "entity:t", 60, metadata)
        .await
        .unwrap();
    assert_eq!(changed.version, 2);

    let loaded = store.get_entry("ver").await.unwrap().unwrap();
    assert_eq!(loaded.metadata.get("pending"), Some(&json!(true)));
    assert!(store.remove_data("ver").await.unwrap());
}

async fn cache_by_type(store: &dyn OfflineStore) {
    let now = Utc::now();
    for (key, ttl) in [("q:b", 60), ("q:a", 60), ("q:old", -1)] {
        store
            .store_data_at(key, json!(key), "query:items", Duration::minutes(ttl), Metadata::new(), now)
            .await
            .unwrap();
    }
    store.store_data("other", json!(0), "query:other", 60).await.unwrap();

    let keys: Vec<_> = store
        .get_entries_by_type_at("query:items", now)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(keys, vec!["q:a", "q:b"]);

    assert_eq!(store.remove_data_by_type("query:items").await.unwrap(), 2);
    assert!(store.get_data("other").await.unwrap().is_some());
    store.remove_data("other").await.unwrap();
}

async fn transactions_fifo(store: &dyn OfflineStore) {
    let client_id = store.client_id().await.unwrap();
    let first = store
        .store_offline_transaction(
            NewTransaction::new(HttpMethod::Post, "/rest/v1/orders", "orders")
                .with_body(json!({"total": 5}))
                .with_header("Prefer", "return=representation"),
        )
        .await
        .unwrap();
    let second = store
        .store_offline_transaction(
            NewTransaction::new(HttpMethod::Delete, "/rest/v1/orders?id=eq.9", "orders")
                .with_entity_id("9"),
        )
        .await
        .unwrap();

    let pending = store.get_pending_transactions().await.unwrap();
    assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first, second]);
    assert_eq!(pending[0].status, TransactionStatus::Pending);
    assert_eq!(pending[0].retry_count, 0);
    assert_eq!(pending[0].client_id, client_id.as_str());
    assert_eq!(pending[0].headers.get("Prefer").map(String::as_str), Some("return=representation"));

    let mut patch = Metadata::new();
    patch.insert("lastError".into(), json!("boom"));
    store
        .update_transaction_status(first, TransactionStatus::Synced, Some(patch))
        .await
        .unwrap();
    assert_eq!(store.bump_transaction_retry(second).await.unwrap(), Some(1));
    assert_eq!(store.bump_transaction_retry(9999).await.unwrap(), None);

    let synced = store.get_transaction(first).await.unwrap().unwrap();
    assert_eq!(synced.status, TransactionStatus::Synced);
    assert_eq!(synced.metadata.get("lastError"), Some(&json!("boom")));

    let pending = store.get_pending_transactions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);

    // Unknown ids are ignored.
    store
        .update_transaction_status(9999, TransactionStatus::Failed, None)
        .await
        .unwrap();
    store
        .update_transaction_status(second, TransactionStatus::Failed, None)
        .await
        .unwrap();
}

async fn queue_priority(store: &dyn OfflineStore) {
    let mut ids = Vec::new();
    for priority in [3, 1, 2] {
        ids.push(
            store
                .add_to_sync_queue(
                    NewSyncItem::new(SyncOperation::Update, "items", json!({"p": priority}))
                        .with_priority(priority),
                )
                .await
                .unwrap(),
        );
    }

    let next = store.get_next_sync_items(10).await.unwrap();
    let priorities: Vec<_> = next.iter().map(|i| i.priority).collect();
    assert_eq!(priorities, vec![1, 2, 3]);
    assert_eq!(store.get_next_sync_items(2).await.unwrap().len(), 2);

    store
        .update_sync_item_status(ids[1], SyncItemStatus::Processing, None)
        .await
        .unwrap();
    let next = store.get_next_sync_items(10).await.unwrap();
    assert_eq!(next.iter().map(|i| i.priority).collect::<Vec<_>>(), vec![2, 3]);

    for id in ids {
        store
            .update_sync_item_status(id, SyncItemStatus::Completed, None)
            .await
            .unwrap();
    }
    assert!(store.get_next_sync_items(10).await.unwrap().is_empty());
}

async fn queue_timestamp_and_backoff(store: &dyn OfflineStore) {
    let now = Utc::now();
    let newer = store
        .add_to_sync_queue_at(
            NewSyncItem::new(SyncOperation::Update, "items", json!({"n": "newer"})).with_priority(4),
            now + Duration::minutes(1),
        )
        .await
        .unwrap();
    let older = store
        .add_to_sync_queue_at(
            NewSyncItem::new(SyncOperation::Update, "items", json!({"n": "older"})).with_priority(4),
            now,
        )
        .await
        .unwrap();

    // Equal priority: earliest timestamp first, whatever the insertion order.
    let next = store.get_next_sync_items(10).await.unwrap();
    assert_eq!(next.iter().map(|i| i.id).collect::<Vec<_>>(), vec![older, newer]);

    // An item waiting out its backoff does not take a slot in the batch.
    store
        .bump_sync_item_retry(older, Some(now + Duration::minutes(5)))
        .await
        .unwrap();
    let due = store.get_due_sync_items(1, now).await.unwrap();
    assert_eq!(due.iter().map(|i| i.id).collect::<Vec<_>>(), vec![newer]);
    let due = store
        .get_due_sync_items(10, now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(due.len(), 2);
    assert_eq!(store.get_next_sync_items(10).await.unwrap().len(), 2);

    for id in [older, newer] {
        store
            .update_sync_item_status(id, SyncItemStatus::Completed, None)
            .await
            .unwrap();
    }
    assert!(store.get_due_sync_items(10, now).await.unwrap().is_empty());
}

async fn queue_retry(store: &dyn OfflineStore) {
    let id = store
        .add_to_sync_queue(
            NewSyncItem::new(SyncOperation::Create, "items", json!({"name": "x"}))
                .with_entity_id("local-1")
                .with_dependencies(vec![41, 42])
                .with_metadata("lastKnownVersion", json!(3)),
        )
        .await
        .unwrap();

    let later = Utc::now() + Duration::seconds(30);
    assert_eq!(store.bump_sync_item_retry(id, Some(later)).await.unwrap(), Some(1));

    let item = store.get_sync_item(id).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.dependencies, vec![41, 42]);
    assert_eq!(item.last_known_version(), Some(&json!(3)));
    assert!(!item.is_due(Utc::now()));
    assert!(item.is_due(later + Duration::seconds(1)));

    let mut patch = Metadata::new();
    patch.insert("lastError".into(), json!("gone"));
    store
        .update_sync_item_status(id, SyncItemStatus::Failed, Some(patch))
        .await
        .unwrap();
    let item = store.get_sync_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Failed);
    assert_eq!(item.metadata.get("lastKnownVersion"), Some(&json!(3)));
    assert_eq!(item.metadata.get("lastError"), Some(&json!("gone")));
}

async fn conflicts_lifecycle(store: &dyn OfflineStore) {
    let conflict = ConflictEntry::new(
        "conflict:items:1",
        "items",
        "1",
        json!({"name": "client"}),
        json!({"name": "server"}),
    )
    .with_metadata("queueId", json!(7));
    store.store_conflict(conflict).await.unwrap();

    let open = store.get_unresolved_conflicts().await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(!open[0].resolved);
    assert!(open[0].resolution.is_none());

    store
        .resolve_conflict("conflict:items:1", ResolutionStrategy::ClientWins, json!({"name": "client"}))
        .await
        .unwrap();
    assert!(store.get_unresolved_conflicts().await.unwrap().is_empty());

    let resolved = store.get_conflict("conflict:items:1").await.unwrap().unwrap();
    assert!(resolved.resolved);
    assert_eq!(resolved.strategy, ResolutionStrategy::ClientWins);
    assert_eq!(resolved.resolution, Some(json!({"name": "client"})));
    assert_eq!(resolved.metadata.get("queueId"), Some(&json!(7)));
}

async fn cleanup_retention(store: &dyn OfflineStore) {
    let now = Utc::now();
    store
        .store_data_at("short", json!(1), "t", Duration::minutes(1), Metadata::new(), now)
        .await
        .unwrap();
    let mut stale = ConflictEntry::new("conflict:items:2", "items", "2", json!({"n": 1}), json!({"n": 2}));
    stale.timestamp = now - Duration::days(30);
    store.store_conflict(stale).await.unwrap();

    // Completed queue items and the resolved conflict are younger than the
    // retention window, so only the expired cache entry goes.
    let report = store
        .cleanup_expired_data_at(now + Duration::days(6))
        .await
        .unwrap();
    assert_eq!(report.expired_entries, 1);
    assert_eq!(report.purged_sync_items, 0);
    assert_eq!(report.purged_conflicts, 0);

    let report = store
        .cleanup_expired_data_at(now + Duration::days(8))
        .await
        .unwrap();
    assert_eq!(report.purged_sync_items, 5);
    assert_eq!(report.purged_conflicts, 1);

    // Unresolved conflicts survive cleanup however old they are.
    let open = store.get_unresolved_conflicts().await.unwrap();
    assert_eq!(open.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(), vec!["conflict:items:2"]);

    // Failed items are kept for inspection.
    let export = store.export_data().await.unwrap();
    assert_eq!(export.sync_queue.len(), 1);
    assert_eq!(export.sync_queue[0].status, SyncItemStatus::Failed);
}

async fn stats_and_export(store: &dyn OfflineStore) {
    store.store_data("s", json!({"x": 1}), "t", 60).await.unwrap();
    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.transactions, 2);
    assert_eq!(stats.cached_entries, 1);
    assert_eq!(stats.sync_queue, 1);
    assert_eq!(stats.conflicts, 1);

    let export = store.export_data().await.unwrap();
    assert_eq!(export.client_id, store.client_id().await.unwrap().as_str());
    assert_eq!(export.transactions.len(), 2);
    assert_eq!(export.cache.len(), 1);
}
