//! Sync scheduling: periodic, reconnect and on-request passes.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use offsync_common::{Error, Result};

use crate::engine::{SyncConfig, SyncOutcome};

/// Why the scheduler started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Background timer while online.
    Periodic,
    /// Connectivity came back and stayed up for the settle delay.
    Reconnect,
    /// Explicit request through `SyncScheduler::request_sync`.
    Requested,
}

/// Timing of the background loop.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub settle_delay: Duration,
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.sync_interval,
            settle_delay: config.settle_delay,
        }
    }
}

enum SchedulerRequest {
    Sync(oneshot::Sender<Result<SyncOutcome>>),
    Shutdown,
}

/// Front end for the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new() -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (Self { request_tx }, SyncSchedulerHandle { request_rx })
    }

    /// Ask the loop for a pass and wait for its outcome.
    ///
    /// # Errors
    /// - `InvalidOperation` if the loop is not running
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(SchedulerRequest::Sync(response_tx))
            .await
            .map_err(|_| Error::InvalidOperation("scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidOperation("scheduler stopped before syncing".to_string()))?
    }

    /// Stop the loop after any pass in flight.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<SchedulerRequest>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// `sync_fn` is awaited inline, so passes never overlap within the loop.
    /// The periodic timer only fires while `online` reads true; each
    /// offline to online edge arms a one-shot reconnect pass after the
    /// settle delay, cancelled if the connection drops again first.
    pub async fn run<F, Fut>(
        mut self,
        sync_fn: F,
        mut online: watch::Receiver<bool>,
        config: SchedulerConfig,
    ) where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncOutcome>> + Send,
    {
        let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settle_at: Option<Instant> = None;
        let mut watching = true;

        info!("Sync scheduler started");

        loop {
            let is_online = *online.borrow();

            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SchedulerRequest::Sync(response_tx)) => {
                        let result = sync_fn(SyncTrigger::Requested).await;
                        let _ = response_tx.send(result);
                    }
                    Some(SchedulerRequest::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                _ = ticker.tick(), if is_online => {
                    log_result(SyncTrigger::Periodic, &sync_fn(SyncTrigger::Periodic).await);
                }

                changed = online.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Connectivity source dropped");
                        watching = false;
                        continue;
                    }
                    if *online.borrow_and_update() {
                        settle_at = Some(Instant::now() + config.settle_delay);
                    } else {
                        settle_at = None;
                    }
                }

                _ = sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                    settle_at = None;
                    ticker.reset();
                    log_result(SyncTrigger::Reconnect, &sync_fn(SyncTrigger::Reconnect).await);
                }
            }
        }
    }
}

fn log_result(trigger: SyncTrigger, result: &Result<SyncOutcome>) {
    match result {
        Ok(SyncOutcome::Completed(summary)) => {
            debug!(
                "{:?} sync completed: {} completed, {} failed, {} conflicts",
                trigger, summary.completed, summary.failed, summary.conflicts
            );
        }
        Ok(SyncOutcome::Skipped { reason }) => {
            debug!("{:?} sync skipped: {:?}", trigger, reason);
        }
        Err(e) => {
            error!("{:?} sync failed: {}", trigger, e);
        }
    }
}
