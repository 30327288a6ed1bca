//! Sync lifecycle events and their observer set.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

use offsync_common::{Error, Result};
use offsync_storage::ConflictEntry;

/// Default maximum number of subscribers.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Running counters of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Items skipped because their dependencies have not synced yet.
    pub deferred: usize,
    /// Record being processed, e.g. `queue:12` or `transaction:3`.
    pub current: Option<String>,
}

/// Totals of a finished sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub deferred: usize,
    pub duration: Duration,
}

impl SyncSummary {
    pub(crate) fn from_progress(progress: &SyncProgress, duration: Duration) -> Self {
        Self {
            total: progress.total,
            completed: progress.completed,
            failed: progress.failed,
            conflicts: progress.conflicts,
            deferred: progress.deferred,
            duration,
        }
    }
}

/// Notification published to the application layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStarted,
    SyncProgress(SyncProgress),
    SyncCompleted(SyncSummary),
    SyncFailed { error: String },
    ConflictDetected { entry: ConflictEntry },
    ConnectionChanged { online: bool },
}

impl SyncEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncStarted => "sync-started",
            Self::SyncProgress(_) => "sync-progress",
            Self::SyncCompleted(_) => "sync-completed",
            Self::SyncFailed { .. } => "sync-failed",
            Self::ConflictDetected { .. } => "conflict-detected",
            Self::ConnectionChanged { .. } => "connection-changed",
        }
    }
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle returned by `EventBus::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Bounded set of synchronous observers.
///
/// Subscribers run on the emitting task, in subscription order. A panicking
/// subscriber is logged and does not affect the others or the emitter.
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Register a callback.
    ///
    /// # Errors
    /// - `InvalidOperation` when the bus is full
    pub fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.lock();
        if subscribers.len() >= self.capacity {
            return Err(Error::InvalidOperation(format!(
                "event bus is full ({} subscribers)",
                self.capacity
            )));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscribers.push((id, Arc::new(callback)));
        Ok(id)
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every subscriber.
    pub fn emit(&self, event: &SyncEvent) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let subscribers: Vec<_> = self.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(event = event.name(), "Event subscriber panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| {
            warn!("Event subscriber list was poisoned");
            poisoned.into_inner()
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
