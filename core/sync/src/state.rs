//! Sync state tracking.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::SyncSummary;

/// Point-in-time view of the sync subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    /// End of the last pass that did any work.
    pub last_sync: Option<DateTime<Utc>>,
    pub last_summary: Option<SyncSummary>,
    /// Error that aborted the last failed pass.
    pub last_error: Option<String>,
    pub pending_transactions: usize,
    pub pending_items: usize,
    pub unresolved_conflicts: usize,
}

/// Mutable bookkeeping shared across passes.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    last_sync: Option<DateTime<Utc>>,
    last_summary: Option<SyncSummary>,
    last_error: Option<String>,
    passes: u64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pass that ran to the end.
    pub fn record_success(&mut self, summary: SyncSummary, finished_at: DateTime<Utc>) {
        self.passes += 1;
        if summary.total > 0 {
            self.last_sync = Some(finished_at);
        }
        self.last_summary = Some(summary);
        self.last_error = None;
    }

    /// Record a pass aborted by `error`.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.passes += 1;
        self.last_error = Some(error.into());
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn last_summary(&self) -> Option<&SyncSummary> {
        self.last_summary.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of passes started, successful or not.
    pub fn passes(&self) -> u64 {
        self.passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pass_keeps_last_sync() {
        let mut state = SyncState::new();
        let now = Utc::now();
        state.record_success(
            SyncSummary {
                total: 2,
                completed: 2,
                ..SyncSummary::default()
            },
            now,
        );
        state.record_success(SyncSummary::default(), now + chrono::Duration::seconds(5));

        assert_eq!(state.last_sync(), Some(now));
        assert_eq!(state.last_summary().map(|s| s.total), Some(0));
        assert_eq!(state.passes(), 2);
    }

    #[test]
    fn test_failure_then_success_clears_error() {
        let mut state = SyncState::new();
        state.record_failure("storage gone");
        assert_eq!(state.last_error(), Some("storage gone"));

        state.record_success(SyncSummary::default(), Utc::now());
        assert!(state.last_error().is_none());
    }
}
