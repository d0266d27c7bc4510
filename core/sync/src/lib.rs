//! ledgerkeep Sync Engine
//!
//! This module keeps a device's local replica in step with the remote
//! authority, including:
//! - Push of the local mutation log and pull of the remote change feed
//! - Live change subscriptions with teardown before resubscribe
//! - Retry strategy with exponential backoff
//! - Scheduling on manual, periodic, connectivity and retry triggers

pub mod channel;
pub mod config;
pub mod engine;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use channel::ChangeChannel;
pub use config::{SyncConfig, SyncMode};
pub use engine::SyncEngine;
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncRequest, SyncRunner, SyncScheduler, SyncSchedulerHandle};
pub use state::{SyncOutcome, SyncPhase, SyncReport, SyncStatus, SyncTrigger};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _status = SyncStatus::default();
        let _report = SyncReport::default();
        let _mode = SyncMode::Manual;
    }
}
