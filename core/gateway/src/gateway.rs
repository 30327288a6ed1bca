//! Online-first reads and offline-first writes.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use offsync_common::{Error, Result};
use offsync_remote::{row_id, HttpRequest, Query, RemoteBackend};
use offsync_storage::keys::{entity_key, entity_type, pending_owner, query_type, LOCAL_ID_PREFIX};
use offsync_storage::{
    Metadata, NewSyncItem, NewTransaction, OfflineDataEntry, OfflineStore, SyncOperation,
};
use offsync_sync::{with_timeout, ConnectivityMonitor, LAST_KNOWN_VERSION_FIELD};

use crate::config::{GatewayConfig, GatewayResponse, ReadOptions};
use crate::overlay::{apply_overlay, merge_patch, pending_metadata, tombstone_metadata};

/// Metadata key tying a queued read to the cache entry it will fill.
const CACHE_KEY_FIELD: &str = "cacheKey";

/// Data access facade used by the application.
///
/// Reads go to the backend when online and fall back to the cache; writes
/// made offline are queued for the sync manager and applied optimistically
/// to local entity snapshots so later reads reflect them.
pub struct DataGateway {
    store: Arc<dyn OfflineStore>,
    backend: Arc<dyn RemoteBackend>,
    connectivity: Arc<ConnectivityMonitor>,
    config: GatewayConfig,
}

impl DataGateway {
    pub fn new(
        store: Arc<dyn OfflineStore>,
        backend: Arc<dyn RemoteBackend>,
        connectivity: Arc<ConnectivityMonitor>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            backend,
            connectivity,
            config,
        }
    }

    /// Start a query builder on `table`.
    pub fn from(&self, table: impl Into<String>) -> TableQuery<'_> {
        TableQuery {
            gateway: self,
            query: Query::new(table),
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // === Reads ===

    /// Run a query.
    ///
    /// # Postconditions
    /// - Online success: rows cached under `Query::cache_key`, `from_cache == false`
    /// - Cached results carry pending offline writes
    ///
    /// # Errors
    /// - `CacheMiss` offline without a cached copy (a refresh is queued)
    /// - `InvalidOperation` offline with caching disabled
    /// - The backend error online when no cached copy exists
    pub async fn select(&self, query: Query, options: ReadOptions) -> Result<GatewayResponse> {
        let key = query.cache_key();
        let caching = self.config.cache_enabled && options.use_cache;

        if !self.is_online() {
            if !caching {
                return Err(Error::InvalidOperation(
                    "offline and cache disabled".to_string(),
                ));
            }
            if let Some(data) = self.read_cache(&query, &key).await? {
                debug!(key = %key, "Serving offline read from cache");
                return Ok(GatewayResponse::cached(data));
            }
            self.queue_refresh(&query, &key).await?;
            return Err(Error::CacheMiss(key));
        }

        if caching && options.cache_first {
            if let Some(data) = self.read_cache(&query, &key).await? {
                return Ok(GatewayResponse::cached(data));
            }
        }

        let remote = with_timeout(self.config.request_timeout, self.backend.select(&query)).await;
        match remote {
            Ok(rows) => {
                let data = Value::Array(rows);
                if caching {
                    let ttl = options.ttl_minutes.unwrap_or(self.config.default_ttl_minutes);
                    if let Err(e) = self
                        .store
                        .store_data(&key, data.clone(), &query_type(&query.table), ttl)
                        .await
                    {
                        warn!(key = %key, "Failed to cache query result: {}", e);
                    }
                }
                Ok(GatewayResponse::remote(data))
            }
            Err(err) if caching => match self.read_cache(&query, &key).await {
                Ok(Some(data)) => {
                    warn!(key = %key, "Remote read failed, serving cache: {}", err);
                    Ok(GatewayResponse::cached(data))
                }
                Ok(None) => Err(err),
                Err(cache_err) => {
                    warn!(key = %key, "Cache fallback failed: {}", cache_err);
                    Err(err)
                }
            },
            Err(err) => Err(err),
        }
    }

    async fn read_cache(&self, query: &Query, key: &str) -> Result<Option<Value>> {
        let Some(entry) = self.store.get_entry(key).await? else {
            return Ok(None);
        };
        let Value::Array(rows) = entry.data else {
            return Ok(Some(entry.data));
        };
        let snapshots = self
            .store
            .get_entries_by_type(&entity_type(&query.table))
            .await?;
        Ok(Some(Value::Array(apply_overlay(rows, &snapshots, query))))
    }

    /// Queue a read so the cache is warm after reconnecting.
    async fn queue_refresh(&self, query: &Query, key: &str) -> Result<()> {
        let already_queued = self
            .store
            .get_next_sync_items(usize::MAX)
            .await?
            .iter()
            .any(|item| {
                item.operation == SyncOperation::Read
                    && item.metadata.get(CACHE_KEY_FIELD).and_then(Value::as_str) == Some(key)
            });
        if already_queued {
            return Ok(());
        }

        let id = self
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Read, query.table.clone(), serde_json::to_value(query)?)
                    .with_max_retries(self.config.max_retries)
                    .with_metadata(CACHE_KEY_FIELD, json!(key)),
            )
            .await?;
        debug!(key = %key, queue_id = id, "Queued cache refresh");
        Ok(())
    }

    // === Writes ===

    /// Insert rows.
    ///
    /// Offline, each row gets a `local-` id unless it already has one, is
    /// queued as a `create`, and is returned as written locally.
    pub async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<GatewayResponse> {
        if !self.is_online() {
            return self.insert_offline(table, rows).await;
        }

        let created = with_timeout(self.config.request_timeout, self.backend.insert(table, rows)).await?;
        for row in &created {
            if let Some(id) = row_id(row) {
                self.refresh_snapshot(table, &id, row.clone()).await;
            }
        }
        self.invalidate_queries(table).await;
        info!(table, rows = created.len(), "Inserted rows");
        Ok(GatewayResponse::remote(Value::Array(created)))
    }

    /// Patch one row.
    pub async fn update(&self, table: &str, id: &str, patch: Value) -> Result<GatewayResponse> {
        if !self.is_online() {
            return self.update_offline(table, id, patch).await;
        }

        let updated =
            with_timeout(self.config.request_timeout, self.backend.update(table, id, patch)).await?;
        self.refresh_snapshot(table, id, updated.clone()).await;
        self.invalidate_queries(table).await;
        debug!(table, id, "Updated row");
        Ok(GatewayResponse::remote(updated))
    }

    /// Delete one row.
    pub async fn delete(&self, table: &str, id: &str) -> Result<GatewayResponse> {
        if !self.is_online() {
            return self.delete_offline(table, id).await;
        }

        with_timeout(self.config.request_timeout, self.backend.delete(table, id)).await?;
        if let Err(e) = self.store.remove_data(&entity_key(table, id)).await {
            warn!(table, id, "Failed to drop snapshot: {}", e);
        }
        self.invalidate_queries(table).await;
        debug!(table, id, "Deleted row");
        Ok(GatewayResponse::remote(json!({ "id": id })))
    }

    async fn insert_offline(&self, table: &str, rows: Vec<Value>) -> Result<GatewayResponse> {
        let mut created = Vec::with_capacity(rows.len());
        let mut queued = Vec::with_capacity(rows.len());

        for mut row in rows {
            let id = row_id(&row)
                .unwrap_or_else(|| format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()));
            if let Some(fields) = row.as_object_mut() {
                fields.insert("id".to_string(), json!(id));
            }

            let queue_id = self
                .store
                .add_to_sync_queue(
                    NewSyncItem::new(SyncOperation::Create, table, row.clone())
                        .with_entity_id(id.clone())
                        .with_max_retries(self.config.max_retries),
                )
                .await?;
            self.write_snapshot(table, &id, row.clone(), pending_metadata(queue_id))
                .await?;

            debug!(table, id = %id, queue_id, "Queued offline insert");
            created.push(row);
            queued.push(queue_id);
        }

        Ok(GatewayResponse::queued(Value::Array(created), queued))
    }

    async fn update_offline(&self, table: &str, id: &str, patch: Value) -> Result<GatewayResponse> {
        let current = self.current_row(table, id).await?;
        let mut item = self.pending_item(SyncOperation::Update, table, id, patch.clone(), current.as_ref());

        let base = current
            .map(|entry| entry.data)
            .unwrap_or_else(|| json!({ "id": id }));
        let merged = merge_patch(Some(&base), &patch);

        item = item.with_max_retries(self.config.max_retries);
        let queue_id = self.store.add_to_sync_queue(item).await?;
        self.write_snapshot(table, id, merged.clone(), pending_metadata(queue_id))
            .await?;

        debug!(table, id, queue_id, "Queued offline update");
        Ok(GatewayResponse::queued(merged, vec![queue_id]))
    }

    async fn delete_offline(&self, table: &str, id: &str) -> Result<GatewayResponse> {
        let current = self.current_row(table, id).await?;
        let item = self
            .pending_item(SyncOperation::Delete, table, id, json!({ "id": id }), current.as_ref())
            .with_max_retries(self.config.max_retries);

        let data = current
            .map(|entry| entry.data)
            .unwrap_or_else(|| json!({ "id": id }));
        let queue_id = self.store.add_to_sync_queue(item).await?;
        self.write_snapshot(table, id, data.clone(), tombstone_metadata(queue_id))
            .await?;

        debug!(table, id, queue_id, "Queued offline delete");
        Ok(GatewayResponse::queued(data, vec![queue_id]))
    }

    /// Last known state of a row: its entity snapshot, or else the widest
    /// copy found in the table's cached query results.
    async fn current_row(&self, table: &str, id: &str) -> Result<Option<OfflineDataEntry>> {
        if let Some(entry) = self.store.get_entry(&entity_key(table, id)).await? {
            return Ok(Some(entry));
        }

        let mut found: Option<(OfflineDataEntry, Value)> = None;
        for entry in self.store.get_entries_by_type(&query_type(table)).await? {
            let Value::Array(rows) = &entry.data else {
                continue;
            };
            let Some(row) = rows
                .iter()
                .filter(|row| row_id(row).as_deref() == Some(id))
                .max_by_key(|row| width(row))
            else {
                continue;
            };
            if found.as_ref().map_or(true, |(_, best)| width(row) > width(best)) {
                found = Some((entry.clone(), row.clone()));
            }
        }

        Ok(found.map(|(entry, row)| {
            debug!(table, id, key = %entry.key, "Using cached query row as baseline");
            OfflineDataEntry {
                data: row,
                metadata: Metadata::new(),
                ..entry
            }
        }))
    }

    /// Build a queued write against the current snapshot.
    ///
    /// The snapshot's concurrency token becomes the conflict baseline, and a
    /// write still pending on the same row becomes a dependency.
    fn pending_item(
        &self,
        operation: SyncOperation,
        table: &str,
        id: &str,
        data: Value,
        current: Option<&OfflineDataEntry>,
    ) -> NewSyncItem {
        let mut item = NewSyncItem::new(operation, table, data).with_entity_id(id);
        if let Some(entry) = current {
            if let Some(token) = self.config.concurrency_token.read(&entry.data) {
                item = item.with_metadata(LAST_KNOWN_VERSION_FIELD, token);
            }
            if let Some(owner) = pending_owner(&entry.metadata) {
                item = item.with_dependencies(vec![owner]);
            }
        }
        item
    }

    async fn write_snapshot(&self, table: &str, id: &str, data: Value, metadata: Metadata) -> Result<()> {
        self.store
            .store_data_with_metadata(
                &entity_key(table, id),
                data,
                &entity_type(table),
                self.config.default_ttl_minutes,
                metadata,
            )
            .await
            .map(|_| ())
    }

    /// Cache a server-confirmed row. Cache failures never fail the write.
    ///
    /// A snapshot still owned by a queued offline write is left alone so
    /// reads keep showing that write until it syncs.
    async fn refresh_snapshot(&self, table: &str, id: &str, row: Value) {
        let key = entity_key(table, id);
        match self.store.get_entry(&key).await {
            Ok(Some(existing)) => {
                if let Some(owner) = pending_owner(&existing.metadata) {
                    debug!(key = %key, owner, "Keeping pending snapshot");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, "Failed to read snapshot: {}", e),
        }
        if let Err(e) = self.write_snapshot(table, id, row, Metadata::new()).await {
            warn!(table, id, "Failed to cache row: {}", e);
        }
    }

    async fn invalidate_queries(&self, table: &str) {
        match self.store.remove_data_by_type(&query_type(table)).await {
            Ok(0) => {}
            Ok(removed) => debug!(table, removed, "Invalidated cached queries"),
            Err(e) => warn!(table, "Failed to invalidate cached queries: {}", e),
        }
    }

    // === Raw requests ===

    /// Send an HTTP-shaped request, or record it for replay when offline.
    ///
    /// # Errors
    /// - `Remote` for a non-2xx answer while online
    pub async fn request(
        &self,
        request: HttpRequest,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<GatewayResponse> {
        if self.is_online() {
            let response = with_timeout(self.config.request_timeout, self.backend.request(request))
                .await?
                .error_for_status()?;
            return Ok(GatewayResponse::remote(response.body));
        }

        let mut txn = NewTransaction::new(request.method, request.url, entity_type)
            .with_max_retries(self.config.max_retries);
        txn.headers = request.headers;
        txn.body = request.body;
        txn.entity_id = entity_id.map(str::to_string);

        let id = self.store.store_offline_transaction(txn).await?;
        debug!(entity_type, transaction_id = id, "Recorded offline request");
        Ok(GatewayResponse {
            data: Value::Null,
            from_cache: true,
            queued: Vec::new(),
            transaction_id: Some(id),
        })
    }
}

/// Query builder bound to a gateway.
pub struct TableQuery<'a> {
    gateway: &'a DataGateway,
    query: Query,
}

impl<'a> TableQuery<'a> {
    /// Comma-separated column list.
    pub fn select(mut self, columns: &str) -> Self {
        self.query = self.query.select(columns);
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.eq(column, value);
        self
    }

    pub fn neq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.neq(column, value);
        self
    }

    pub fn gt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.gt(column, value);
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.gte(column, value);
        self
    }

    pub fn lt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.lt(column, value);
        self
    }

    pub fn lte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.lte(column, value);
        self
    }

    pub fn like(mut self, column: &str, pattern: &str) -> Self {
        self.query = self.query.like(column, pattern);
        self
    }

    pub fn in_list(mut self, column: &str, values: Vec<Value>) -> Self {
        self.query = self.query.in_list(column, values);
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.query = self.query.order(column, ascending);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn execute(self, options: ReadOptions) -> Result<GatewayResponse> {
        self.gateway.select(self.query, options).await
    }

    pub async fn insert(self, rows: Vec<Value>) -> Result<GatewayResponse> {
        self.gateway.insert(&self.query.table, rows).await
    }

    pub async fn update(self, id: &str, patch: Value) -> Result<GatewayResponse> {
        self.gateway.update(&self.query.table, id, patch).await
    }

    pub async fn delete(self, id: &str) -> Result<GatewayResponse> {
        self.gateway.delete(&self.query.table, id).await
    }
}

fn width(row: &Value) -> usize {
    row.as_object().map_or(0, |fields| fields.len())
}
