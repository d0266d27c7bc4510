//! Sync cycle state, status snapshots and per-cycle reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Phase of the per-account sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No cycle running.
    Idle,
    /// A push/pull cycle is in progress.
    Syncing,
    /// The last cycle failed; waiting for the retry deadline.
    ErrorBackoff,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::ErrorBackoff => "error-backoff",
        }
    }
}

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Explicit user request.
    Manual,
    /// Connectivity regained.
    Reconnect,
    /// App returned to the foreground.
    Foreground,
    /// Periodic timer tick.
    Periodic,
    /// A local write was made.
    LocalChange,
    /// Backoff deadline reached.
    RetryTimer,
}

impl SyncTrigger {
    /// Whether the trigger respects the backoff deadline.
    ///
    /// Only user requests and visibility/connectivity events run ahead of it.
    pub fn honors_backoff(&self) -> bool {
        matches!(self, SyncTrigger::Periodic | SyncTrigger::LocalChange)
    }
}

/// Snapshot of the engine's state for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_error: Option<String>,
    /// Last successful cycle; survives restarts.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// When the next retry is due while in backoff.
    pub retry_at: Option<DateTime<Utc>>,
    /// Unacknowledged mutation log entries.
    pub pending_mutations: u64,
    /// Records waiting for operator resolution.
    pub conflicts: u64,
}

impl SyncStatus {
    pub fn new(last_synced_at: Option<DateTime<Utc>>) -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_error: None,
            last_synced_at,
            consecutive_failures: 0,
            retry_at: None,
            pending_mutations: 0,
            conflicts: 0,
        }
    }

    pub fn is_backing_off(&self) -> bool {
        self.phase == SyncPhase::ErrorBackoff
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Counters of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Mutation log entries acknowledged by the remote.
    pub pushed: usize,
    /// Remote changes received by the pull.
    pub pulled: usize,
    /// Pulled changes that replaced local content.
    pub applied: usize,
    /// Pulled changes that left a record in conflict.
    pub conflicts: usize,
    /// Pulled changes dropped for a payload mismatch.
    pub skipped_malformed: usize,
    /// Entries not pushed because their record awaits resolution.
    pub held_back: usize,
    /// Entries the remote refused outright.
    pub rejected: usize,
    pub duration: Duration,
}

/// Result of asking the engine to sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was already running; nothing was done.
    AlreadyRunning,
    /// Backoff deadline not reached yet.
    Deferred,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
