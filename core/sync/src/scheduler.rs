//! Sync scheduling - explicit, event-driven, periodic and retry triggers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ledgerkeep_common::{now, Error, Result};

use crate::config::SyncMode;
use crate::state::{SyncOutcome, SyncTrigger};

/// Something that can run sync cycles on request.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// Run (or defer, or skip) a cycle for `trigger`.
    async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncOutcome>;

    /// When a failed cycle should be retried, if backing off.
    async fn retry_at(&self) -> Option<DateTime<Utc>>;
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a cycle.
    Sync(SyncTrigger),
    /// Shutdown the scheduler.
    Shutdown,
}

type Responder = oneshot::Sender<Result<SyncOutcome>>;

/// Scheduler for managing sync timing and requests.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<(SyncRequest, Responder)>,
    /// Shutdown signal.
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_rx: Some(request_rx),
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a cycle and wait for its outcome.
    pub async fn request(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Sync(trigger), response_tx))
            .await
            .map_err(|_| Error::Conflict("Sync scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Conflict("Sync scheduler dropped the request".to_string()))?
    }

    /// Queue a cycle without waiting for it.
    ///
    /// Local-change notifications only count in hybrid mode. Returns whether
    /// the trigger was queued.
    pub async fn notify(&self, trigger: SyncTrigger) -> bool {
        if trigger == SyncTrigger::LocalChange {
            let mode = self.mode.read().await.clone();
            if !mode.syncs_on_change() {
                debug!("Change notification ignored (mode: {:?})", mode);
                return false;
            }
        }

        let (response_tx, _) = oneshot::channel();
        match self.request_tx.try_send((SyncRequest::Sync(trigger), response_tx)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping sync trigger {:?}: {}", trigger, e);
                false
            }
        }
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.shutdown.write().await;
        *is_shutdown = true;

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: Option<mpsc::Receiver<(SyncRequest, Responder)>>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. Returns when the scheduler is
    /// shut down or every [`SyncScheduler`] clone is dropped.
    pub async fn run(mut self, runner: Arc<dyn SyncRunner>) {
        let Some(mut request_rx) = self.request_rx.take() else {
            error!("Sync scheduler handle already consumed");
            return;
        };
        let mut current_interval = self.get_interval_duration().await;
        let mut periodic_interval = Self::create_periodic_interval(current_interval);
        let mut retry_deadline = Self::deadline(runner.retry_at().await);

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Sync(trigger), response_tx)) => {
                            debug!("Processing sync request: {:?}", trigger);
                            let result = runner.run_sync(trigger).await;
                            Self::log_result(trigger, &result);
                            let _ = response_tx.send(result);
                        }
                        Some((SyncRequest::Shutdown, _)) | None => {
                            info!("Received shutdown request");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    debug!("Triggering periodic sync");
                    let result = runner.run_sync(SyncTrigger::Periodic).await;
                    Self::log_result(SyncTrigger::Periodic, &result);
                }

                _ = Self::wait_for_retry(retry_deadline) => {
                    debug!("Backoff elapsed, retrying sync");
                    retry_deadline = None;
                    let result = runner.run_sync(SyncTrigger::RetryTimer).await;
                    Self::log_result(SyncTrigger::RetryTimer, &result);
                }
            }

            retry_deadline = Self::deadline(runner.retry_at().await);

            // Recreate interval if mode changed
            let expected_interval = self.get_interval_duration().await;
            if current_interval != expected_interval {
                current_interval = expected_interval;
                periodic_interval = Self::create_periodic_interval(current_interval);
            }
        }
    }

    fn create_periodic_interval(period: Option<Duration>) -> Option<Interval> {
        period.map(|period| {
            // First tick one period from now, not immediately.
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        })
    }

    async fn get_interval_duration(&self) -> Option<Duration> {
        self.mode.read().await.interval()
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn wait_for_retry(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn deadline(retry_at: Option<DateTime<Utc>>) -> Option<Instant> {
        let wait = (retry_at? - now()).to_std().unwrap_or(Duration::ZERO);
        Some(Instant::now() + wait)
    }

    fn log_result(trigger: SyncTrigger, result: &Result<SyncOutcome>) {
        match result {
            Ok(SyncOutcome::Completed(report)) => {
                info!(
                    "{:?} sync completed: {} pushed, {} pulled, {} conflicts",
                    trigger, report.pushed, report.pulled, report.conflicts
                );
            }
            Ok(outcome) => debug!("{:?} sync not run: {:?}", trigger, outcome),
            Err(e) => error!("{:?} sync failed: {}", trigger, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncReport;
    use std::sync::Mutex;

    /// Records the triggers it was asked to run.
    #[derive(Default)]
    struct RecordingRunner {
        triggers: Mutex<Vec<SyncTrigger>>,
        retry_at: Mutex<Option<DateTime<Utc>>>,
    }

    impl RecordingRunner {
        fn triggers(&self) -> Vec<SyncTrigger> {
            self.triggers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncRunner for RecordingRunner {
        async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
            self.triggers.lock().unwrap().push(trigger);
            if trigger == SyncTrigger::RetryTimer {
                *self.retry_at.lock().unwrap() = None;
            }
            Ok(SyncOutcome::Completed(SyncReport {
                pushed: 1,
                ..SyncReport::default()
            }))
        }

        async fn retry_at(&self) -> Option<DateTime<Utc>> {
            *self.retry_at.lock().unwrap()
        }
    }

    fn spawn(handle: SyncSchedulerHandle, runner: Arc<RecordingRunner>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { handle.run(runner).await })
    }

    #[tokio::test]
    async fn test_scheduler_creation() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);
        let mode = scheduler.get_mode().await;
        assert!(matches!(mode, SyncMode::Manual));
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);

        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_secs(60),
            })
            .await;

        let mode = scheduler.get_mode().await;
        assert!(matches!(mode, SyncMode::Periodic { .. }));
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let runner = Arc::new(RecordingRunner::default());
        let task = spawn(handle, runner.clone());

        let outcome = scheduler.request(SyncTrigger::Manual).await.unwrap();
        assert_eq!(outcome.report().unwrap().pushed, 1);
        assert_eq!(runner.triggers(), vec![SyncTrigger::Manual]);

        scheduler.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_request_after_shutdown_fails() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let task = spawn(handle, Arc::new(RecordingRunner::default()));

        scheduler.shutdown().await;
        let _ = task.await;

        assert!(scheduler.request(SyncTrigger::Manual).await.is_err());
    }

    #[tokio::test]
    async fn test_local_change_only_in_hybrid_mode() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let runner = Arc::new(RecordingRunner::default());
        let task = spawn(handle, runner.clone());

        assert!(!scheduler.notify(SyncTrigger::LocalChange).await);

        scheduler
            .set_mode(SyncMode::Hybrid {
                interval: Duration::from_secs(3600),
            })
            .await;
        assert!(scheduler.notify(SyncTrigger::LocalChange).await);

        // Requests are served in order, so the notification ran first.
        scheduler.request(SyncTrigger::Manual).await.unwrap();
        assert_eq!(
            runner.triggers(),
            vec![SyncTrigger::LocalChange, SyncTrigger::Manual]
        );

        scheduler.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_periodic_ticks() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
            interval: Duration::from_millis(20),
        });
        let runner = Arc::new(RecordingRunner::default());
        let task = spawn(handle, runner.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown().await;
        let _ = task.await;

        let periodic = runner
            .triggers()
            .into_iter()
            .filter(|t| *t == SyncTrigger::Periodic)
            .count();
        assert!(periodic >= 2, "expected periodic ticks, got {}", periodic);
    }

    #[tokio::test]
    async fn test_retry_timer_fires_at_deadline() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let runner = Arc::new(RecordingRunner::default());
        *runner.retry_at.lock().unwrap() = Some(now() + chrono::Duration::milliseconds(30));
        let task = spawn(handle, runner.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;
        let _ = task.await;

        assert_eq!(runner.triggers(), vec![SyncTrigger::RetryTimer]);
    }
}
