//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;

/// When sync cycles run on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only explicit requests and connectivity/visibility events.
    Manual,
    /// Additionally at regular intervals.
    Periodic { interval: Duration },
    /// Periodic, plus a cycle after each local write.
    Hybrid { interval: Duration },
}

impl SyncMode {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            SyncMode::Manual => None,
        }
    }

    /// Whether local writes trigger a cycle.
    pub fn syncs_on_change(&self) -> bool {
        matches!(self, SyncMode::Hybrid { .. })
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Periodic {
            interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for the sync engine and its scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Time budget for a single remote call.
    pub request_timeout: Duration,
    /// Changes requested per pull page.
    pub pull_batch_size: usize,
    /// Retries of a single remote call inside one cycle.
    pub max_retries: u32,
    /// Backoff between failed cycles.
    pub retry: RetryConfig,
    /// Open live subscriptions when sync starts.
    pub subscribe_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            request_timeout: Duration::from_secs(15),
            pull_batch_size: 200,
            max_retries: 2,
            retry: RetryConfig::new(0),
            subscribe_on_start: true,
        }
    }
}

impl SyncConfig {
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_subscribe_on_start(mut self, subscribe: bool) -> Self {
        self.subscribe_on_start = subscribe;
        self
    }

    /// Per-call retry policy used inside a cycle.
    pub(crate) fn call_retry(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
    }
}
