//! Core sync engine that drains the offline queues against the backend.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use offsync_common::{ClientId, ConcurrencyToken, Error, Result};
use offsync_remote::{row_id, HttpRequest, Query, RemoteBackend};
use offsync_storage::keys::{
    entity_key, entity_type, is_local_id, pending_owner, query_type, PENDING_FLAG, QUEUE_ID_FIELD,
};
use offsync_storage::{
    ConflictEntry, Metadata, NewSyncItem, OfflineStore, OfflineTransaction, ResolutionStrategy,
    SyncItemStatus, SyncOperation, SyncQueueItem, TransactionStatus,
};

use crate::conflict::{conflict_key, ConflictResolver, Resolution};
use crate::events::{EventBus, SyncEvent, SyncProgress, SyncSummary, DEFAULT_EVENT_CAPACITY};
use crate::network::ConnectivityMonitor;
use crate::retry::{with_timeout, RetryConfig, RetryExecutor};
use crate::state::{SyncState, SyncStatus};

/// Metadata key holding the server id assigned to a synced create.
pub const SERVER_ID_FIELD: &str = "serverId";
/// Metadata key holding the concurrency token of the row a synced item produced.
pub const SERVER_VERSION_FIELD: &str = "serverVersion";
/// Metadata key holding the token the client saw when it queued a write.
pub const LAST_KNOWN_VERSION_FIELD: &str = "lastKnownVersion";

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the background timer while online.
    pub sync_interval: Duration,
    /// Delay between an offline to online transition and the reconnect pass.
    pub settle_delay: Duration,
    /// Fallback connectivity polling period.
    pub poll_interval: Duration,
    /// Maximum queue items taken per pass.
    pub batch_size: usize,
    /// Bound on every backend call.
    pub request_timeout: Duration,
    /// Retry budget for items the engine enqueues itself.
    pub default_max_retries: u32,
    /// Whether `start` runs the background scheduler.
    pub auto_sync: bool,
    pub concurrency_token: ConcurrencyToken,
    pub retry: RetryConfig,
    /// TTL of cache entries written by the engine.
    pub cache_ttl_minutes: i64,
    pub event_capacity: usize,
}

impl SyncConfig {
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_concurrency_token(mut self, token: ConcurrencyToken) -> Self {
        self.concurrency_token = token;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            request_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            auto_sync: true,
            concurrency_token: ConcurrencyToken::default(),
            retry: RetryConfig::default(),
            cache_ttl_minutes: 60,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SyncOutcome {
    Completed(SyncSummary),
    Skipped { reason: SkipReason },
}

impl SyncOutcome {
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            Self::Skipped { .. } => None,
        }
    }
}

/// What happened to one record during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Completed,
    /// Failed this pass; returned to pending with backoff.
    Retrying,
    Failed,
    Conflict,
    Deferred,
}

enum Gate {
    Ready,
    Waiting,
    Blocked(i64),
}

/// Server-side identity of a queued update or delete.
struct Target {
    id: String,
    baseline: Option<Value>,
}

/// Clears the syncing flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Main sync engine.
///
/// Runs at most one pass at a time. Within a pass, pending transactions are
/// replayed first in FIFO order, then due queue items in (priority, timestamp)
/// order. Each record settles independently; nothing is rolled back.
pub struct SyncEngine {
    store: Arc<dyn OfflineStore>,
    backend: Arc<dyn RemoteBackend>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    resolver: ConflictResolver,
    retry: RetryExecutor,
    events: Arc<EventBus>,
    syncing: AtomicBool,
    state: RwLock<SyncState>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn OfflineStore>,
        backend: Arc<dyn RemoteBackend>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            resolver: ConflictResolver::new(config.concurrency_token.clone()),
            retry: RetryExecutor::new(config.retry.clone()),
            events: Arc::new(EventBus::new(config.event_capacity)),
            store,
            backend,
            connectivity,
            config,
            syncing: AtomicBool::new(false),
            state: RwLock::new(SyncState::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Run a pass if online and idle.
    ///
    /// Being offline or already syncing is not an error: the call is a
    /// logged no-op reported as `SyncOutcome::Skipped`.
    ///
    /// # Errors
    /// - Any store error that aborted the pass (after `sync-failed` is emitted)
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        if !self.connectivity.is_online() {
            debug!("Skipping sync pass: offline");
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::Offline,
            });
        }
        self.run_guarded().await
    }

    /// Run a pass on explicit request.
    ///
    /// # Errors
    /// - `InvalidOperation` if offline; nothing is touched
    /// - Any store error that aborted the pass
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        if !self.connectivity.is_online() {
            return Err(Error::InvalidOperation(
                "cannot force a sync while offline".to_string(),
            ));
        }
        self.run_guarded().await
    }

    async fn run_guarded(&self) -> Result<SyncOutcome> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Sync pass already in progress, ignoring request");
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::AlreadySyncing,
            });
        }
        let _guard = PassGuard(&self.syncing);

        let started = Instant::now();
        self.events.emit(&SyncEvent::SyncStarted);

        match self.run_pass(started).await {
            Ok(summary) => {
                info!(
                    "Sync pass completed in {:?}: {} completed, {} failed, {} conflicts, {} deferred",
                    summary.duration,
                    summary.completed,
                    summary.failed,
                    summary.conflicts,
                    summary.deferred
                );
                self.state
                    .write()
                    .await
                    .record_success(summary.clone(), Utc::now());
                self.events.emit(&SyncEvent::SyncCompleted(summary.clone()));
                Ok(SyncOutcome::Completed(summary))
            }
            Err(err) => {
                error!("Sync pass aborted: {}", err);
                self.state.write().await.record_failure(err.to_string());
                self.events.emit(&SyncEvent::SyncFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_pass(&self, started: Instant) -> Result<SyncSummary> {
        let now = Utc::now();
        let transactions = self.store.get_pending_transactions().await?;
        let items = self
            .store
            .get_due_sync_items(self.config.batch_size, now)
            .await?;

        let mut progress = SyncProgress {
            total: transactions.len() + items.len(),
            ..SyncProgress::default()
        };
        if progress.total == 0 {
            debug!("Nothing to sync");
            return Ok(SyncSummary::from_progress(&progress, started.elapsed()));
        }

        info!(
            "Starting sync pass: {} transactions, {} queue items",
            transactions.len(),
            items.len()
        );
        let client_id = self.store.client_id().await?;

        for txn in transactions {
            progress.current = Some(format!("transaction:{}", txn.id));
            let outcome = self.process_transaction(txn, &client_id).await?;
            self.report(&mut progress, outcome);
        }

        for item in items {
            progress.current = Some(format!("queue:{}", item.id));
            let outcome = self.process_item(item).await?;
            self.report(&mut progress, outcome);
        }

        Ok(SyncSummary::from_progress(&progress, started.elapsed()))
    }

    fn report(&self, progress: &mut SyncProgress, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Completed => progress.completed += 1,
            RecordOutcome::Retrying | RecordOutcome::Failed => progress.failed += 1,
            RecordOutcome::Conflict => progress.conflicts += 1,
            RecordOutcome::Deferred => progress.deferred += 1,
        }
        self.events.emit(&SyncEvent::SyncProgress(progress.clone()));
    }

    /// Bound a backend call by the configured request timeout.
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.config.request_timeout, fut).await
    }

    // === Transactions ===

    async fn process_transaction(
        &self,
        txn: OfflineTransaction,
        client_id: &ClientId,
    ) -> Result<RecordOutcome> {
        debug!("Replaying transaction {}: {} {}", txn.id, txn.method, txn.url);
        self.store
            .update_transaction_status(txn.id, TransactionStatus::Syncing, None)
            .await?;

        let mut request = HttpRequest::new(txn.method, txn.url.clone());
        request.headers = txn.headers.clone();
        request = request
            .with_header("X-Client-Id", client_id.as_str())
            .with_header("X-Client-Timestamp", txn.timestamp.to_rfc3339())
            .with_header("X-Offline-Transaction-Id", txn.id.to_string());
        if let Some(body) = txn.body.clone() {
            request = request.with_body(body);
        }

        let response = match self.call(self.backend.request(request)).await {
            Ok(response) if response.is_conflict() => {
                return self.transaction_conflict(&txn, response.body).await;
            }
            Ok(response) => response.error_for_status(),
            Err(err) => Err(err),
        };

        match response {
            Ok(response) => {
                let mut patch = Metadata::new();
                patch.insert("response".into(), response.body);
                patch.insert("syncedAt".into(), json!(Utc::now().to_rfc3339()));
                self.store
                    .update_transaction_status(txn.id, TransactionStatus::Synced, Some(patch))
                    .await?;
                Ok(RecordOutcome::Completed)
            }
            Err(err) => self.transaction_failed(&txn, err).await,
        }
    }

    async fn transaction_conflict(
        &self,
        txn: &OfflineTransaction,
        server_data: Value,
    ) -> Result<RecordOutcome> {
        let entity_id = txn.entity_id.clone().unwrap_or_else(|| txn.url.clone());
        let key = conflict_key(&txn.entity_type, &entity_id, &format!("t{}", txn.id));
        warn!("Transaction {} conflicted on replay ({})", txn.id, key);

        let entry = ConflictEntry::new(
            key.clone(),
            txn.entity_type.clone(),
            entity_id,
            txn.body.clone().unwrap_or(Value::Null),
            server_data,
        )
        .with_metadata("transactionId", json!(txn.id));

        let mut patch = Metadata::new();
        patch.insert("conflictKey".into(), json!(key));
        self.store
            .update_transaction_status(txn.id, TransactionStatus::Conflict, Some(patch))
            .await?;
        self.store.store_conflict(entry.clone()).await?;
        self.events.emit(&SyncEvent::ConflictDetected { entry });
        Ok(RecordOutcome::Conflict)
    }

    async fn transaction_failed(&self, txn: &OfflineTransaction, err: Error) -> Result<RecordOutcome> {
        warn!("Transaction {} failed: {}", txn.id, err);
        let mut patch = failure_patch(&err);

        // The stored count stops at max_retries; the final attempt only marks it exhausted.
        if err.is_retryable() {
            if txn.retry_count < txn.max_retries {
                self.store.bump_transaction_retry(txn.id).await?;
                self.store
                    .update_transaction_status(txn.id, TransactionStatus::Pending, Some(patch))
                    .await?;
                return Ok(RecordOutcome::Retrying);
            }
            patch.insert("exhausted".into(), json!(true));
        }

        self.store
            .update_transaction_status(txn.id, TransactionStatus::Failed, Some(patch))
            .await?;
        Ok(RecordOutcome::Failed)
    }

    // === Queue items ===

    async fn process_item(&self, item: SyncQueueItem) -> Result<RecordOutcome> {
        match self.gate(&item).await? {
            Gate::Ready => {}
            Gate::Waiting => {
                debug!("Deferring queue item {}: dependencies pending", item.id);
                return Ok(RecordOutcome::Deferred);
            }
            Gate::Blocked(dependency) => {
                let err = Error::InvalidOperation(format!("dependency {} failed", dependency));
                warn!("Queue item {} cannot sync: {}", item.id, err);
                self.store
                    .update_sync_item_status(item.id, SyncItemStatus::Failed, Some(failure_patch(&err)))
                    .await?;
                return Ok(RecordOutcome::Failed);
            }
        }

        debug!(
            "Processing queue item {}: {} {}",
            item.id, item.operation, item.entity_type
        );
        self.store
            .update_sync_item_status(item.id, SyncItemStatus::Processing, None)
            .await?;

        match self.dispatch(&item).await {
            Ok(patch) => {
                self.store
                    .update_sync_item_status(item.id, SyncItemStatus::Completed, Some(patch))
                    .await?;
                Ok(RecordOutcome::Completed)
            }
            Err(Error::Conflict(details)) => {
                let key = conflict_key(&details.entity_type, &details.entity_id, &format!("q{}", item.id));
                warn!("Queue item {} conflicted ({})", item.id, key);
                let entry = ConflictEntry::new(
                    key.clone(),
                    details.entity_type,
                    details.entity_id,
                    details.client_data,
                    details.server_data,
                )
                .with_metadata("queueItemId", json!(item.id))
                .with_metadata("operation", json!(item.operation.as_str()));

                let mut patch = Metadata::new();
                patch.insert("conflictKey".into(), json!(key));
                self.store
                    .update_sync_item_status(item.id, SyncItemStatus::Failed, Some(patch))
                    .await?;
                self.store.store_conflict(entry.clone()).await?;
                self.events.emit(&SyncEvent::ConflictDetected { entry });
                Ok(RecordOutcome::Conflict)
            }
            Err(err @ (Error::Storage(_) | Error::StorageUnavailable(_))) => Err(err),
            Err(err) => self.item_failed(&item, err).await,
        }
    }

    async fn gate(&self, item: &SyncQueueItem) -> Result<Gate> {
        for dependency in &item.dependencies {
            // A purged dependency completed long ago.
            let Some(parent) = self.store.get_sync_item(*dependency).await? else {
                continue;
            };
            match parent.status {
                SyncItemStatus::Completed => {}
                SyncItemStatus::Failed => return Ok(Gate::Blocked(parent.id)),
                SyncItemStatus::Pending | SyncItemStatus::Processing => return Ok(Gate::Waiting),
            }
        }
        Ok(Gate::Ready)
    }

    async fn item_failed(&self, item: &SyncQueueItem, err: Error) -> Result<RecordOutcome> {
        warn!("Queue item {} failed: {}", item.id, err);
        let mut patch = failure_patch(&err);

        if err.is_retryable() {
            let attempts = item.retry_count + 1;
            if attempts <= item.max_retries {
                let next = self.config.retry.next_attempt_at(attempts, Utc::now());
                self.store.bump_sync_item_retry(item.id, Some(next)).await?;
                patch.insert("nextAttemptAt".into(), json!(next.to_rfc3339()));
                self.store
                    .update_sync_item_status(item.id, SyncItemStatus::Pending, Some(patch))
                    .await?;
                return Ok(RecordOutcome::Retrying);
            }
            patch.insert("exhausted".into(), json!(true));
        }

        self.store
            .update_sync_item_status(item.id, SyncItemStatus::Failed, Some(patch))
            .await?;
        Ok(RecordOutcome::Failed)
    }

    async fn dispatch(&self, item: &SyncQueueItem) -> Result<Metadata> {
        match item.operation {
            SyncOperation::Create => self.push_create(item).await,
            SyncOperation::Update => self.push_update(item).await,
            SyncOperation::Delete => self.push_delete(item).await,
            SyncOperation::Read => self.refresh_read(item).await,
        }
    }

    async fn push_create(&self, item: &SyncQueueItem) -> Result<Metadata> {
        let mut row = item.data.clone();
        let local_id = item.entity_id.clone().or_else(|| row_id(&row));
        if let (Some(fields), Some(local)) = (row.as_object_mut(), local_id.as_deref()) {
            if is_local_id(local) {
                fields.remove("id");
            }
        }

        let created = self
            .call(self.backend.insert(&item.entity_type, vec![row]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Serialization("insert returned no rows".to_string()))?;

        let mut patch = synced_patch();
        if let Some(token) = self.resolver.token().read(&created) {
            patch.insert(SERVER_VERSION_FIELD.into(), token);
        }
        if let Some(local) = local_id.as_deref().filter(|id| is_local_id(id)) {
            self.release_snapshot(&entity_key(&item.entity_type, local), item.id)
                .await?;
        }
        if let Some(server_id) = row_id(&created) {
            debug!("Created {}/{} from queue item {}", item.entity_type, server_id, item.id);
            patch.insert(SERVER_ID_FIELD.into(), json!(server_id));
            self.settle_snapshot(&item.entity_type, &server_id, created, item.id)
                .await?;
        }
        Ok(patch)
    }

    async fn push_update(&self, item: &SyncQueueItem) -> Result<Metadata> {
        let target = self.target(item).await?;
        let server = self
            .call(self.backend.fetch(&item.entity_type, &target.id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("{}/{}", item.entity_type, target.id)))?;

        if self.resolver.detect(&server, target.baseline.as_ref()) {
            return Err(Error::conflict(
                item.entity_type.clone(),
                target.id,
                item.data.clone(),
                server,
            ));
        }

        let updated = self
            .call(self.backend.update(&item.entity_type, &target.id, without_id(&item.data)))
            .await?;

        let mut patch = synced_patch();
        if let Some(token) = self.resolver.token().read(&updated) {
            patch.insert(SERVER_VERSION_FIELD.into(), token);
        }
        self.settle_snapshot(&item.entity_type, &target.id, updated, item.id)
            .await?;
        Ok(patch)
    }

    async fn push_delete(&self, item: &SyncQueueItem) -> Result<Metadata> {
        let target = self.target(item).await?;
        match self
            .call(self.backend.delete(&item.entity_type, &target.id))
            .await
        {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!("{}/{} already gone on the server", item.entity_type, target.id);
            }
            Err(err) => return Err(err),
        }

        self.store
            .remove_data(&entity_key(&item.entity_type, &target.id))
            .await?;
        if let Some(local) = item.entity_id.as_deref().filter(|id| is_local_id(id)) {
            self.store
                .remove_data(&entity_key(&item.entity_type, local))
                .await?;
        }
        Ok(synced_patch())
    }

    async fn refresh_read(&self, item: &SyncQueueItem) -> Result<Metadata> {
        let query: Query = serde_json::from_value(item.data.clone())?;
        let rows = self.call(self.backend.select(&query)).await?;
        let count = rows.len();
        self.store
            .store_data(
                &query.cache_key(),
                Value::Array(rows),
                &query_type(&query.table),
                self.config.cache_ttl_minutes,
            )
            .await?;

        let mut patch = synced_patch();
        patch.insert("rows".into(), json!(count));
        Ok(patch)
    }

    /// Resolve the server id and concurrency baseline of an update or delete.
    ///
    /// Local ids are mapped through the create they depend on; a completed
    /// write earlier in the chain supersedes the captured baseline.
    async fn target(&self, item: &SyncQueueItem) -> Result<Target> {
        let mut id = item
            .entity_id
            .clone()
            .or_else(|| row_id(&item.data))
            .ok_or_else(|| {
                Error::InvalidInput(format!("queue item {} has no entity id", item.id))
            })?;
        let mut baseline = item.last_known_version().cloned();

        for dependency in &item.dependencies {
            let Some(parent) = self.store.get_sync_item(*dependency).await? else {
                continue;
            };
            if parent.status != SyncItemStatus::Completed {
                continue;
            }
            if is_local_id(&id) && parent.entity_id.as_deref() == Some(id.as_str()) {
                if let Some(server_id) = parent.metadata.get(SERVER_ID_FIELD).and_then(Value::as_str) {
                    id = server_id.to_string();
                }
            }
            if let Some(version) = parent.metadata.get(SERVER_VERSION_FIELD).filter(|v| !v.is_null()) {
                baseline = Some(version.clone());
            }
        }

        if is_local_id(&id) {
            return Err(Error::InvalidOperation(format!(
                "{}/{} has not been created on the server",
                item.entity_type, id
            )));
        }
        Ok(Target { id, baseline })
    }

    /// Replace an entity snapshot with the server row.
    ///
    /// A snapshot still carrying a later pending write is left alone so the
    /// optimistic state survives until that write syncs.
    async fn settle_snapshot(&self, table: &str, id: &str, row: Value, queue_id: i64) -> Result<()> {
        let key = entity_key(table, id);
        if let Some(existing) = self.store.get_entry(&key).await? {
            if let Some(owner) = pending_owner(&existing.metadata) {
                if owner != queue_id {
                    debug!("Keeping pending snapshot {} owned by queue item {}", key, owner);
                    return Ok(());
                }
            }
        }
        self.store
            .store_data(&key, row, &entity_type(table), self.config.cache_ttl_minutes)
            .await
    }

    /// Drop a local-id snapshot once its create has synced, unless a later
    /// write still owns it.
    async fn release_snapshot(&self, key: &str, queue_id: i64) -> Result<()> {
        if let Some(existing) = self.store.get_entry(key).await? {
            match pending_owner(&existing.metadata) {
                Some(owner) if owner != queue_id => {}
                _ => {
                    self.store.remove_data(key).await?;
                }
            }
        }
        Ok(())
    }

    // === Conflicts ===

    /// Apply a resolution strategy to a stored conflict.
    ///
    /// # Errors
    /// - `InvalidOperation` if the key is unknown or already resolved, or
    ///   `manual` is requested without a payload
    /// - Any backend error while pushing online; the conflict stays open
    pub async fn resolve_conflict(
        &self,
        key: &str,
        strategy: ResolutionStrategy,
        resolution: Option<Value>,
    ) -> Result<ConflictEntry> {
        let mut entry = self
            .store
            .get_conflict(key)
            .await?
            .ok_or_else(|| Error::InvalidOperation(format!("unknown conflict: {}", key)))?;
        if entry.resolved {
            return Err(Error::InvalidOperation(format!(
                "conflict {} is already resolved",
                key
            )));
        }

        let plan = self.resolver.plan(&entry, strategy, resolution)?;
        if plan.push {
            self.push_resolution(&entry, &plan).await?;
        } else {
            self.store
                .store_data(
                    &entity_key(&entry.entity_type, &entry.entity_id),
                    plan.payload.clone(),
                    &entity_type(&entry.entity_type),
                    self.config.cache_ttl_minutes,
                )
                .await?;
        }

        self.store
            .resolve_conflict(key, strategy, plan.payload.clone())
            .await?;
        entry.mark_resolved(strategy, plan.payload);
        info!("Resolved conflict {} with {}", key, strategy);
        Ok(entry)
    }

    async fn push_resolution(&self, entry: &ConflictEntry, plan: &Resolution) -> Result<()> {
        let table = entry.entity_type.clone();
        let id = entry.entity_id.clone();
        let key = entity_key(&table, &id);
        let body = without_id(&plan.payload);

        if self.connectivity.is_online() {
            let backend = self.backend.clone();
            let timeout = self.config.request_timeout;
            let updated = self
                .retry
                .execute("conflict push", || {
                    let backend = backend.clone();
                    let (table, id, body) = (table.clone(), id.clone(), body.clone());
                    async move { with_timeout(timeout, backend.update(&table, &id, body)).await }
                })
                .await?;
            return self
                .store
                .store_data(&key, updated, &entity_type(&table), self.config.cache_ttl_minutes)
                .await;
        }

        // Offline: queue the write against the server state the user just saw.
        let baseline = self
            .resolver
            .token()
            .read(&entry.server_data)
            .unwrap_or(Value::Null);
        let queue_id = self
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Update, table.clone(), body)
                    .with_entity_id(id)
                    .with_max_retries(self.config.default_max_retries)
                    .with_metadata(LAST_KNOWN_VERSION_FIELD, baseline)
                    .with_metadata("conflictKey", json!(entry.key)),
            )
            .await?;
        debug!("Queued resolution of {} as item {}", entry.key, queue_id);

        let mut metadata = Metadata::new();
        metadata.insert(PENDING_FLAG.into(), json!(true));
        metadata.insert(QUEUE_ID_FIELD.into(), json!(queue_id));
        self.store
            .store_data_with_metadata(
                &key,
                ConflictResolver::merge(&plan.payload, &entry.server_data),
                &entity_type(&table),
                self.config.cache_ttl_minutes,
                metadata,
            )
            .await?;
        Ok(())
    }

    /// Unresolved conflicts, oldest first.
    pub async fn get_conflicts(&self) -> Result<Vec<ConflictEntry>> {
        self.store.get_unresolved_conflicts().await
    }

    /// Snapshot of connectivity, pass state and queue depths.
    pub async fn get_sync_status(&self) -> Result<SyncStatus> {
        let pending_transactions = self.store.get_pending_transactions().await?.len();
        let pending_items = self.store.get_next_sync_items(usize::MAX).await?.len();
        let unresolved_conflicts = self.store.get_unresolved_conflicts().await?.len();

        let state = self.state.read().await;
        Ok(SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: self.is_syncing(),
            last_sync: state.last_sync(),
            last_summary: state.last_summary().cloned(),
            last_error: state.last_error().map(str::to_string),
            pending_transactions,
            pending_items,
            unresolved_conflicts,
        })
    }
}

fn synced_patch() -> Metadata {
    let mut patch = Metadata::new();
    patch.insert("syncedAt".into(), json!(Utc::now().to_rfc3339()));
    patch
}

fn failure_patch(err: &Error) -> Metadata {
    let mut patch = Metadata::new();
    patch.insert("lastError".into(), json!(err.to_string()));
    patch.insert("lastAttemptAt".into(), json!(Utc::now().to_rfc3339()));
    patch
}

fn without_id(data: &Value) -> Value {
    let mut data = data.clone();
    if let Some(fields) = data.as_object_mut() {
        fields.remove("id");
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::HttpMethod;
    use offsync_remote::{Failure, HttpResponse, MemoryBackend};
    use offsync_storage::{MemoryStore, NewTransaction};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<MemoryBackend>,
        connectivity: Arc<ConnectivityMonitor>,
        engine: Arc<SyncEngine>,
    }

    fn fixture_with(config: SyncConfig, backend: MemoryBackend) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(backend);
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            backend.clone(),
            connectivity.clone(),
            config,
        ));
        Fixture {
            store,
            backend,
            connectivity,
            engine,
        }
    }

    fn fixture() -> Fixture {
        let retry = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .without_jitter();
        fixture_with(SyncConfig::default().with_retry(retry), MemoryBackend::new())
    }

    fn completed(outcome: SyncOutcome) -> SyncSummary {
        match outcome {
            SyncOutcome::Completed(summary) => summary,
            other => panic!("expected a completed pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_pass_reports_zero_counts() {
        let f = fixture();
        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.completed, 0);
    }

    #[tokio::test]
    async fn test_create_then_dependent_update_in_one_pass() {
        let f = fixture();
        let create = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Create, "products", json!({"id": "local-1", "name": "Tea"}))
                    .with_entity_id("local-1"),
            )
            .await
            .unwrap();
        let update = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Update, "products", json!({"price": 4}))
                    .with_entity_id("local-1")
                    .with_dependencies(vec![create]),
            )
            .await
            .unwrap();

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.completed, 2);

        let created = f.store.get_sync_item(create).await.unwrap().unwrap();
        let server_id = created.metadata[SERVER_ID_FIELD].as_str().unwrap().to_string();
        let row = f.backend.row("products", &server_id).unwrap();
        assert_eq!(row["name"], "Tea");
        assert_eq!(row["price"], 4);
        assert_eq!(
            f.store.get_sync_item(update).await.unwrap().unwrap().status,
            SyncItemStatus::Completed
        );
        assert!(f
            .store
            .get_entry(&entity_key("products", "local-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_update_escalates_to_conflict() {
        let f = fixture();
        f.backend.seed("products", vec![json!({"id": "1", "name": "Tea"})]);
        f.backend.touch("products", "1", json!({"name": "Green tea"}));

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        f.engine
            .events()
            .subscribe(move |event| {
                if let SyncEvent::ConflictDetected { .. } = event {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let id = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Update, "products", json!({"name": "Black tea"}))
                    .with_entity_id("1")
                    .with_metadata(LAST_KNOWN_VERSION_FIELD, json!(1)),
            )
            .await
            .unwrap();
        let writes_before = f.backend.write_count();

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.conflicts, 1);

        let item = f.store.get_sync_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, SyncItemStatus::Failed);
        assert_eq!(item.retry_count, 0);

        let conflicts = f.engine.get_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].client_data, json!({"name": "Black tea"}));
        assert_eq!(conflicts[0].server_data["name"], "Green tea");
        assert_eq!(f.backend.write_count(), writes_before);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        // Conflicts are never retried.
        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn test_server_wins_is_final() {
        let f = fixture();
        f.backend.seed("products", vec![json!({"id": "1", "name": "Tea"})]);
        f.backend.touch("products", "1", json!({"name": "Green tea"}));
        f.store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Update, "products", json!({"name": "Black tea"}))
                    .with_entity_id("1")
                    .with_metadata(LAST_KNOWN_VERSION_FIELD, json!(1)),
            )
            .await
            .unwrap();
        f.engine.sync_all().await.unwrap();
        let key = f.engine.get_conflicts().await.unwrap()[0].key.clone();
        let server = f.store.get_conflict(&key).await.unwrap().unwrap().server_data;

        let resolved = f
            .engine
            .resolve_conflict(&key, ResolutionStrategy::ServerWins, None)
            .await
            .unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution, Some(server.clone()));

        let again = f
            .engine
            .resolve_conflict(&key, ResolutionStrategy::ClientWins, None)
            .await;
        assert!(matches!(again, Err(Error::InvalidOperation(_))));

        let stored = f.store.get_conflict(&key).await.unwrap().unwrap();
        assert_eq!(stored.strategy, ResolutionStrategy::ServerWins);
        assert_eq!(stored.resolution, Some(server));
        assert!(f.engine.get_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_wins_pushes_online_and_queues_offline() {
        let f = fixture();
        f.backend.seed("products", vec![json!({"id": "1", "name": "Tea"})]);
        let conflict = |key: &str| {
            ConflictEntry::new(
                key,
                "products",
                "1",
                json!({"name": "Mine"}),
                json!({"id": "1", "name": "Theirs", "version": 2}),
            )
        };
        f.store.store_conflict(conflict("c1")).await.unwrap();
        f.store.store_conflict(conflict("c2")).await.unwrap();

        f.engine
            .resolve_conflict("c1", ResolutionStrategy::ClientWins, None)
            .await
            .unwrap();
        assert_eq!(f.backend.row("products", "1").unwrap()["name"], "Mine");

        f.connectivity.set_online(false);
        f.engine
            .resolve_conflict("c2", ResolutionStrategy::Merge, Some(json!({"name": "Ours"})))
            .await
            .unwrap();
        let queued = f.store.get_next_sync_items(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, SyncOperation::Update);
        assert_eq!(queued[0].last_known_version(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_manual_and_unknown_resolutions_rejected() {
        let f = fixture();
        f.store
            .store_conflict(ConflictEntry::new("c", "products", "1", json!({}), json!({})))
            .await
            .unwrap();

        assert!(matches!(
            f.engine.resolve_conflict("c", ResolutionStrategy::Manual, None).await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(!f.store.get_conflict("c").await.unwrap().unwrap().resolved);
        assert!(matches!(
            f.engine.resolve_conflict("nope", ResolutionStrategy::ServerWins, None).await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_force_sync_offline_is_rejected_without_side_effects() {
        let f = fixture();
        f.store
            .add_to_sync_queue(NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"})))
            .await
            .unwrap();
        f.connectivity.set_online(false);

        let result = f.engine.force_sync().await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert_eq!(
            f.engine.sync_all().await.unwrap(),
            SyncOutcome::Skipped {
                reason: SkipReason::Offline
            }
        );

        let status = f.engine.get_sync_status().await.unwrap();
        assert_eq!(status.pending_items, 1);
        assert!(status.last_summary.is_none());
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_a_noop() {
        let f = fixture_with(
            SyncConfig::default(),
            MemoryBackend::new().with_latency(Duration::from_millis(100)),
        );
        f.store
            .add_to_sync_queue(NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"})))
            .await
            .unwrap();

        let first = tokio::spawn({
            let engine = f.engine.clone();
            async move { engine.sync_all().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.engine.is_syncing());

        let second = f.engine.sync_all().await.unwrap();
        assert_eq!(
            second,
            SyncOutcome::Skipped {
                reason: SkipReason::AlreadySyncing
            }
        );

        let summary = completed(first.await.unwrap().unwrap());
        assert_eq!(summary.completed, 1);
        assert_eq!(f.backend.write_count(), 1);
        assert!(!f.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_fails() {
        let f = fixture();
        let id = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"}))
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        f.backend.set_failure(Some(Failure::Status(503)));

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.failed, 1);
        let item = f.store.get_sync_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, SyncItemStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert!(item.next_attempt_at.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.engine.sync_all().await.unwrap();
        let item = f.store.get_sync_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, SyncItemStatus::Failed);
        assert_eq!(item.retry_count, item.max_retries);
        assert_eq!(item.metadata["exhausted"], json!(true));
        assert!(item.metadata.contains_key("lastError"));
    }

    #[tokio::test]
    async fn test_items_in_backoff_do_not_fill_the_batch() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(3600))
            .without_jitter();
        let f = fixture_with(
            SyncConfig::default().with_retry(retry).with_batch_size(1),
            MemoryBackend::new(),
        );
        let stalled = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"}))
                    .with_priority(1),
            )
            .await
            .unwrap();
        f.backend.set_failure(Some(Failure::Status(503)));
        completed(f.engine.sync_all().await.unwrap());
        f.backend.set_failure(None);

        let due = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Coffee"}))
                    .with_priority(2),
            )
            .await
            .unwrap();

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.total, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(
            f.store.get_sync_item(due).await.unwrap().unwrap().status,
            SyncItemStatus::Completed
        );
        let stalled = f.store.get_sync_item(stalled).await.unwrap().unwrap();
        assert_eq!(stalled.status, SyncItemStatus::Pending);
        assert_eq!(stalled.retry_count, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let f = fixture();
        let id = f
            .store
            .add_to_sync_queue(NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"})))
            .await
            .unwrap();
        f.backend.set_failure(Some(Failure::Status(400)));

        f.engine.sync_all().await.unwrap();
        let item = f.store.get_sync_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, SyncItemStatus::Failed);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn test_dependent_item_waits_for_parent() {
        let f = fixture();
        let parent = f
            .store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"}))
                    .with_priority(5),
            )
            .await
            .unwrap();
        f.store
            .add_to_sync_queue(
                NewSyncItem::new(SyncOperation::Delete, "products", json!({}))
                    .with_entity_id("9")
                    .with_priority(1)
                    .with_dependencies(vec![parent]),
            )
            .await
            .unwrap();

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.completed, 1);

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_delete_not_found_counts_as_success() {
        let f = fixture();
        let id = f
            .store
            .add_to_sync_queue(NewSyncItem::new(SyncOperation::Delete, "products", json!({})).with_entity_id("404"))
            .await
            .unwrap();
        f.engine.sync_all().await.unwrap();
        assert_eq!(
            f.store.get_sync_item(id).await.unwrap().unwrap().status,
            SyncItemStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_read_item_warms_cache() {
        let f = fixture();
        f.backend.seed("products", vec![json!({"id": "1", "name": "Tea"})]);
        let query = Query::new("products").eq("name", "Tea");
        f.store
            .add_to_sync_queue(NewSyncItem::new(
                SyncOperation::Read,
                "products",
                serde_json::to_value(&query).unwrap(),
            ))
            .await
            .unwrap();

        f.engine.sync_all().await.unwrap();
        let cached = f.store.get_data(&query.cache_key()).await.unwrap().unwrap();
        assert_eq!(cached.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_transaction_replay_and_conflict() {
        let f = fixture();
        let ok = f
            .store
            .store_offline_transaction(
                NewTransaction::new(HttpMethod::Post, "/rest/v1/orders", "orders").with_body(json!({"total": 3})),
            )
            .await
            .unwrap();
        let clash = f
            .store
            .store_offline_transaction(
                NewTransaction::new(HttpMethod::Patch, "/rest/v1/orders?id=eq.1", "orders")
                    .with_entity_id("1")
                    .with_body(json!({"total": 5})),
            )
            .await
            .unwrap();
        f.backend.push_response(HttpResponse::new(201, json!({"id": 1})));
        f.backend.push_response(HttpResponse::new(409, json!({"total": 4})));

        let summary = completed(f.engine.sync_all().await.unwrap());
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.conflicts, 1);

        let synced = f.store.get_transaction(ok).await.unwrap().unwrap();
        assert_eq!(synced.status, TransactionStatus::Synced);
        assert_eq!(synced.metadata["response"], json!({"id": 1}));

        let conflicted = f.store.get_transaction(clash).await.unwrap().unwrap();
        assert_eq!(conflicted.status, TransactionStatus::Conflict);
        let key = conflicted.metadata["conflictKey"].as_str().unwrap();
        let entry = f.store.get_conflict(key).await.unwrap().unwrap();
        assert_eq!(entry.server_data, json!({"total": 4}));

        let calls = f.backend.calls();
        let replay = calls.iter().find(|call| call.operation == "POST").unwrap();
        assert_eq!(replay.target, "/rest/v1/orders");
        assert_eq!(replay.body, Some(json!({"total": 3})));
    }

    #[tokio::test]
    async fn test_transaction_network_failure_retries() {
        let f = fixture();
        let id = f
            .store
            .store_offline_transaction(NewTransaction::new(HttpMethod::Delete, "/rest/v1/orders?id=eq.1", "orders"))
            .await
            .unwrap();
        f.backend.set_failure(Some(Failure::Network));

        f.engine.sync_all().await.unwrap();
        let txn = f.store.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);
        assert_eq!(txn.retry_count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_transaction_keeps_count_at_limit() {
        let f = fixture();
        let id = f
            .store
            .store_offline_transaction(
                NewTransaction::new(HttpMethod::Delete, "/rest/v1/orders?id=eq.1", "orders").with_max_retries(2),
            )
            .await
            .unwrap();
        f.backend.set_failure(Some(Failure::Timeout));

        for _ in 0..4 {
            f.engine.sync_all().await.unwrap();
        }
        let txn = f.store.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Failed);
        assert_eq!(txn.retry_count, 2);
        assert_eq!(txn.metadata["exhausted"], json!(true));
    }
}
