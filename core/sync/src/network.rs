//! Connectivity detection.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use offsync_common::Error;
use offsync_remote::{Query, RemoteBackend};

/// Source of truth for "can we reach the backend right now".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe that issues a one-row select against the backend.
///
/// Any response, including an application error, proves the backend is
/// reachable; only transport failures count as offline.
pub struct BackendProbe {
    backend: Arc<dyn RemoteBackend>,
    table: String,
    timeout: Duration,
}

impl BackendProbe {
    pub fn new(backend: Arc<dyn RemoteBackend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for BackendProbe {
    async fn is_online(&self) -> bool {
        let query = Query::new(self.table.clone()).limit(1);
        match tokio::time::timeout(self.timeout, self.backend.select(&query)).await {
            Ok(Ok(_)) => true,
            Ok(Err(Error::Network(_) | Error::Timeout(_))) | Err(_) => false,
            Ok(Err(_)) => true,
        }
    }
}

/// Shared online/offline flag.
///
/// Platform signals call `set_online`; an optional probe is polled as a
/// fallback for missed signals. Observers follow changes via `subscribe`.
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a platform signal. Returns whether the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Poll `probe` every `interval` until the monitor is dropped.
    pub fn spawn_probe(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.is_online().await;
                let Some(monitor) = monitor.upgrade() else {
                    debug!("Connectivity monitor dropped, stopping probe");
                    break;
                };
                monitor.set_online(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_remote::{Failure, MemoryBackend};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ConnectivityProbe for FlagProbe {
        async fn is_online(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_set_online_notifies_on_change_only() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_drives_state() {
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let probe = Arc::new(FlagProbe(AtomicBool::new(false)));
        let mut rx = monitor.subscribe();

        let task = monitor.spawn_probe(probe.clone(), Duration::from_millis(10));
        rx.changed().await.unwrap();
        assert!(!monitor.is_online());

        probe.0.store(true, Ordering::SeqCst);
        rx.changed().await.unwrap();
        assert!(monitor.is_online());
        task.abort();
    }

    #[tokio::test]
    async fn test_backend_probe() {
        let backend = Arc::new(MemoryBackend::new());
        let probe = BackendProbe::new(backend.clone(), "health");
        assert!(probe.is_online().await);

        backend.set_failure(Some(Failure::Network));
        assert!(!probe.is_online().await);

        backend.set_failure(Some(Failure::Status(401)));
        assert!(probe.is_online().await);
    }
}
