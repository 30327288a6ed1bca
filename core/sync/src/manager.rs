//! Sync manager: engine, scheduler and connectivity under one lifecycle.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use offsync_common::Result;
use offsync_remote::RemoteBackend;
use offsync_storage::{ConflictEntry, OfflineStore, ResolutionStrategy};

use crate::engine::{SyncConfig, SyncEngine, SyncOutcome};
use crate::events::{EventBus, SyncEvent};
use crate::network::{ConnectivityMonitor, ConnectivityProbe};
use crate::scheduler::{SchedulerConfig, SyncScheduler};
use crate::state::SyncStatus;

/// Owner of the background sync machinery.
///
/// Lifecycle is `new` → `start` → `destroy`. Dropping the manager without
/// calling `destroy` leaves its tasks running until the runtime shuts down.
pub struct SyncManager {
    engine: Arc<SyncEngine>,
    connectivity: Arc<ConnectivityMonitor>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    scheduler: Mutex<Option<SyncScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn OfflineStore>,
        backend: Arc<dyn RemoteBackend>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let engine = SyncEngine::new(store, backend, connectivity.clone(), config);
        Self {
            engine: Arc::new(engine),
            connectivity,
            probe: None,
            scheduler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Poll `probe` as a fallback for missed connectivity signals.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Spawn the background tasks. Must be called within a Tokio runtime.
    ///
    /// # Postconditions
    /// - Calling again while started is a no-op
    pub fn start(&self) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            debug!("Sync manager already started");
            return;
        }
        let config = self.engine.config().clone();

        let mut online = self.connectivity.subscribe();
        let events = self.engine.events().clone();
        tasks.push(tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let online = *online.borrow_and_update();
                events.emit(&SyncEvent::ConnectionChanged { online });
            }
        }));

        if config.auto_sync {
            let (scheduler, handle) = SyncScheduler::new();
            let engine = self.engine.clone();
            tasks.push(tokio::spawn(handle.run(
                move |trigger| {
                    let engine = engine.clone();
                    async move {
                        debug!("Sync triggered: {:?}", trigger);
                        engine.sync_all().await
                    }
                },
                self.connectivity.subscribe(),
                SchedulerConfig::from(&config),
            )));
            *lock(&self.scheduler) = Some(scheduler);
        }

        if let Some(probe) = &self.probe {
            tasks.push(
                self.connectivity
                    .spawn_probe(probe.clone(), config.poll_interval),
            );
        }

        info!(
            auto_sync = config.auto_sync,
            "Sync manager started ({} tasks)",
            tasks.len()
        );
    }

    /// Stop every background task and detach all subscribers.
    pub async fn destroy(&self) {
        let scheduler = lock(&self.scheduler).take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.engine.events().clear();
        info!("Sync manager destroyed");
    }

    /// Run a pass if online and idle; see `SyncEngine::sync_all`.
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        self.engine.sync_all().await
    }

    /// Run a pass now, failing if offline; see `SyncEngine::force_sync`.
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        self.engine.force_sync().await
    }

    /// Route a pass through the scheduler loop when it is running.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let scheduler = lock(&self.scheduler).clone();
        match scheduler {
            Some(scheduler) => scheduler.request_sync().await,
            None => self.engine.sync_all().await,
        }
    }

    pub async fn resolve_conflict(
        &self,
        key: &str,
        strategy: ResolutionStrategy,
        resolution: Option<Value>,
    ) -> Result<ConflictEntry> {
        self.engine.resolve_conflict(key, strategy, resolution).await
    }

    pub async fn get_sync_status(&self) -> Result<SyncStatus> {
        self.engine.get_sync_status().await
    }

    pub async fn get_conflicts(&self) -> Result<Vec<ConflictEntry>> {
        self.engine.get_conflicts().await
    }

    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Sync manager lock was poisoned");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_remote::MemoryBackend;
    use offsync_storage::{MemoryStore, NewSyncItem, SyncItemStatus, SyncOperation};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(online: bool, config: SyncConfig) -> (SyncManager, Arc<MemoryStore>, Arc<MemoryBackend>) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let manager = SyncManager::new(store.clone(), backend.clone(), connectivity, config);
        (manager, store, backend)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue() {
        let config = SyncConfig::default()
            .with_settle_delay(Duration::from_millis(20))
            .with_sync_interval(Duration::from_secs(3600));
        let (manager, store, backend) = manager(false, config);
        let id = store
            .add_to_sync_queue(NewSyncItem::new(SyncOperation::Create, "products", json!({"name": "Tea"})))
            .await
            .unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        manager
            .events()
            .subscribe(move |event| {
                if let SyncEvent::ConnectionChanged { online: true } = event {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        manager.start();
        manager.start();
        manager.connectivity().set_online(true);

        assert!(wait_for(|| backend.rows("products").len() == 1).await);
        let status = store.get_sync_item(id).await.unwrap().unwrap().status;
        assert_eq!(status, SyncItemStatus::Completed);
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        manager.destroy().await;
        assert!(manager.events().is_empty());
    }

    #[tokio::test]
    async fn test_request_sync_without_scheduler() {
        let (manager, _store, _backend) = manager(true, SyncConfig::default().with_auto_sync(false));
        manager.start();
        let outcome = manager.request_sync().await.unwrap();
        assert_eq!(outcome.summary().map(|s| s.total), Some(0));

        let status = manager.get_sync_status().await.unwrap();
        assert!(status.is_online);
        assert!(!status.is_syncing);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_request_sync_through_scheduler() {
        let (manager, _store, _backend) = manager(true, SyncConfig::default());
        manager.start();
        let outcome = manager.request_sync().await.unwrap();
        assert!(outcome.summary().is_some());
        manager.destroy().await;
    }
}
