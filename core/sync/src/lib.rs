//! offsync sync manager
//!
//! Drains the offline store against the remote backend:
//! - transaction replay and typed queue item dispatch
//! - conflict detection over one configured concurrency token
//! - retry with exponential backoff for transient failures
//! - periodic and reconnect scheduling driven by connectivity

pub mod conflict;
pub mod engine;
pub mod events;
pub mod manager;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod state;

pub use conflict::{conflict_key, ConflictResolver, Resolution};
pub use engine::{
    SkipReason, SyncConfig, SyncEngine, SyncOutcome, LAST_KNOWN_VERSION_FIELD, SERVER_ID_FIELD,
    SERVER_VERSION_FIELD,
};
pub use events::{EventBus, SubscriptionId, SyncEvent, SyncProgress, SyncSummary};
pub use manager::SyncManager;
pub use network::{BackendProbe, ConnectivityMonitor, ConnectivityProbe};
pub use retry::{with_timeout, RetryConfig, RetryExecutor};
pub use scheduler::{SchedulerConfig, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use state::{SyncState, SyncStatus};
