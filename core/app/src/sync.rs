//! Sync attachment for a [`Ledger`].
//!
//! Wires the engine, the live change channel and the scheduler together and
//! translates connectivity and visibility events into triggers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledgerkeep_common::Result;
use ledgerkeep_remote::RemoteAuthority;
use ledgerkeep_store::RecordStore;
use ledgerkeep_sync::{
    ChangeChannel, SyncConfig, SyncEngine, SyncOutcome, SyncRunner, SyncScheduler,
    SyncSchedulerHandle, SyncStatus, SyncTrigger,
};

use crate::ledger::Ledger;

/// Keeps a ledger in step with a remote authority.
pub struct LedgerSync<R: RemoteAuthority + ?Sized + 'static> {
    engine: Arc<SyncEngine<R>>,
    channel: Arc<ChangeChannel<R>>,
    scheduler: SyncScheduler,
    handle: Mutex<Option<SyncSchedulerHandle>>,
    online: Arc<AtomicBool>,
    local_changes: Arc<Notify>,
    started: AtomicBool,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config: SyncConfig,
}

impl<R: RemoteAuthority + ?Sized + 'static> LedgerSync<R> {
    pub fn new(ledger: &Ledger, remote: Arc<R>, config: SyncConfig) -> Result<Self> {
        let db = ledger.database();
        let account = ledger.account().clone();
        let engine = SyncEngine::new(
            remote.clone(),
            db.clone(),
            account.clone(),
            ledger.actor(),
            config.clone(),
        )?;
        let channel = ChangeChannel::new(remote, RecordStore::new(db, account));
        let (scheduler, handle) = SyncScheduler::new(config.mode.clone());

        Ok(Self {
            engine: Arc::new(engine),
            channel: Arc::new(channel),
            scheduler,
            handle: Mutex::new(Some(handle)),
            online: ledger.online_flag(),
            local_changes: ledger.local_changes(),
            started: AtomicBool::new(false),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    pub fn channel(&self) -> &Arc<ChangeChannel<R>> {
        &self.channel
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Start the scheduler and the local-change forwarder.
    ///
    /// Opens live subscriptions if online and queues an initial cycle.
    pub async fn start(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            debug!("Ledger sync already started");
            return;
        };

        let runner: Arc<dyn SyncRunner> = self.engine.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(handle.run(runner)));

        let scheduler = self.scheduler.clone();
        let changes = self.local_changes.clone();
        let token = self.token.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = changes.notified() => {
                        scheduler.notify(SyncTrigger::LocalChange).await;
                    }
                }
            }
        }));
        drop(tasks);

        self.started.store(true, Ordering::SeqCst);
        info!("Ledger sync started for {}", self.engine.account());

        if self.is_online() {
            if self.config.subscribe_on_start {
                self.subscribe().await;
            }
            self.scheduler.notify(SyncTrigger::Foreground).await;
        }
    }

    /// Stop background work and close live subscriptions.
    pub async fn shutdown(&self) {
        self.token.cancel();
        if self.started.swap(false, Ordering::SeqCst) {
            self.scheduler.shutdown().await;
        }
        self.channel.unsubscribe_all().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Sync task ended abnormally: {}", e);
            }
        }
        info!("Ledger sync stopped for {}", self.engine.account());
    }

    /// Current sync status.
    pub fn sync_status(&self) -> Result<SyncStatus> {
        self.engine.status()
    }

    /// Explicit user request for a cycle.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        self.run(SyncTrigger::Manual).await
    }

    /// Connectivity changed.
    ///
    /// Going offline closes live subscriptions; coming back re-establishes
    /// them and runs a cycle.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        info!(
            "{} is now {}",
            self.engine.account(),
            if online { "online" } else { "offline" }
        );

        if online {
            self.subscribe().await;
            self.kick(SyncTrigger::Reconnect).await;
        } else if let Err(e) = self.channel.on_connectivity(false).await {
            warn!("Failed to close subscriptions: {}", e);
        }
    }

    /// The app returned to the foreground.
    pub async fn on_foreground(&self) {
        if !self.is_online() {
            return;
        }
        self.subscribe().await;
        self.kick(SyncTrigger::Foreground).await;
    }

    async fn subscribe(&self) {
        match self.channel.on_foreground().await {
            Ok(count) => debug!("{} live subscriptions open", count),
            Err(e) => warn!("Failed to subscribe to remote changes: {}", e),
        }
    }

    /// Queue a cycle on the scheduler, or run it inline when not started.
    async fn kick(&self, trigger: SyncTrigger) {
        if self.started.load(Ordering::SeqCst) {
            self.scheduler.notify(trigger).await;
        } else if let Err(e) = self.engine.handle_trigger(trigger).await {
            warn!("{:?} sync failed: {}", trigger, e);
        }
    }

    async fn run(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
        if self.started.load(Ordering::SeqCst) {
            self.scheduler.request(trigger).await
        } else {
            self.engine.handle_trigger(trigger).await
        }
    }
}
