//! Core sync engine that orchestrates push and pull cycles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use ledgerkeep_common::{
    now, AccountId, Actor, ConnectivityMode, EntityType, Error, RecordId, Result, SyncState,
};
use ledgerkeep_remote::{ChangeBatch, RemoteAck, RemoteAuthority, RemoteChange, RemoteWrite};
use ledgerkeep_store::{
    ApplyOutcome, AuditAction, AuditTrail, CursorStore, Database, MutationEntry, MutationLog,
    MutationOp, NewAuditEntry, RecordStore,
};

use crate::config::SyncConfig;
use crate::retry::RetryExecutor;
use crate::scheduler::SyncRunner;
use crate::state::{SyncOutcome, SyncPhase, SyncReport, SyncStatus, SyncTrigger};

/// Per-account sync engine.
///
/// A cycle pushes the mutation log to the remote authority, then pulls the
/// remote change feed of every entity type. At most one cycle runs at a
/// time; a request arriving while one runs returns
/// [`SyncOutcome::AlreadyRunning`] instead of queueing.
pub struct SyncEngine<R: RemoteAuthority + ?Sized> {
    /// Remote authority to sync with.
    remote: Arc<R>,
    account: AccountId,
    records: RecordStore,
    mutations: MutationLog,
    audit: AuditTrail,
    cursors: CursorStore,
    /// Identity attached to pushed writes.
    actor: RwLock<Actor>,
    /// Held for the duration of a cycle.
    cycle: tokio::sync::Mutex<()>,
    status: Mutex<SyncStatus>,
    /// Retries of single remote calls inside a cycle.
    calls: RetryExecutor,
    config: SyncConfig,
}

impl<R: RemoteAuthority + ?Sized> SyncEngine<R> {
    /// Create an engine for one account of the local database.
    pub fn new(
        remote: Arc<R>,
        db: Arc<Database>,
        account: AccountId,
        actor: Actor,
        config: SyncConfig,
    ) -> Result<Self> {
        let cursors = CursorStore::new(db.clone(), account.clone());
        let last_synced_at = cursors.last_synced_at()?;
        let calls = RetryExecutor::new(config.call_retry()).with_timeout(config.request_timeout);

        Ok(Self {
            remote,
            records: RecordStore::new(db.clone(), account.clone()),
            mutations: MutationLog::new(db.clone(), account.clone()),
            audit: AuditTrail::new(db, account.clone()),
            cursors,
            account,
            actor: RwLock::new(actor),
            cycle: tokio::sync::Mutex::new(()),
            status: Mutex::new(SyncStatus::new(last_synced_at)),
            calls,
            config,
        })
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Change the identity attached to pushed writes (e.g. after login).
    pub async fn set_actor(&self, actor: Actor) {
        *self.actor.write().await = actor;
    }

    /// Current status, including queue and conflict counts.
    pub fn status(&self) -> Result<SyncStatus> {
        let mut status = self.lock_status().clone();
        status.pending_mutations = self.mutations.pending_count()?;
        status.conflicts = self.records.count_by_state(SyncState::Conflict)?;
        Ok(status)
    }

    /// Retry deadline while backing off.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        let status = self.lock_status();
        if status.is_backing_off() {
            status.retry_at
        } else {
            None
        }
    }

    /// Run a cycle on behalf of `trigger`.
    ///
    /// Periodic and local-change triggers are deferred while the engine is
    /// backing off and the retry deadline has not passed.
    pub async fn handle_trigger(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
        if trigger.honors_backoff() {
            if let Some(retry_at) = self.retry_at() {
                if now() < retry_at {
                    debug!("Sync trigger {:?} deferred until {}", trigger, retry_at);
                    return Ok(SyncOutcome::Deferred);
                }
            }
        }
        self.sync().await
    }

    /// Run one push/pull cycle now.
    ///
    /// On a transport failure the engine enters error-backoff and the error
    /// is returned; local state is left as it was, with unacknowledged
    /// entries still queued.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let Ok(_running) = self.cycle.try_lock() else {
            debug!("Sync already running for {}", self.account);
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let mut guard = CycleGuard::enter(&self.status);
        let started = Instant::now();
        info!("Starting sync for {} against {}", self.account, self.remote.name());

        let mut report = SyncReport::default();
        let result = match self.push(&mut report).await {
            Ok(()) => self.pull(&mut report).await,
            Err(e) => Err(e),
        };
        report.duration = started.elapsed();

        match result {
            Ok(()) => {
                let finished_at = now();
                let cursors = self.cursors.clone();
                blocking(move || cursors.set_last_synced_at(finished_at)).await?;
                guard.succeed(finished_at);
                info!(
                    "Sync completed for {}: {} pushed, {} pulled, {} applied, {} conflicts, {} malformed in {:?}",
                    self.account,
                    report.pushed,
                    report.pulled,
                    report.applied,
                    report.conflicts,
                    report.skipped_malformed,
                    report.duration
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                let retry_at = guard.fail(&e, &self.config);
                error!(
                    "Sync failed for {}: {}. Next retry at {}",
                    self.account, e, retry_at
                );
                Err(e)
            }
        }
    }

    /// Upload queued local writes in log order.
    async fn push(&self, report: &mut SyncReport) -> Result<()> {
        let actor = self.actor.read().await.clone();

        for entity_type in EntityType::ALL {
            let mutations = self.mutations.clone();
            let entries = blocking(move || mutations.pending(entity_type)).await?;
            if entries.is_empty() {
                continue;
            }
            debug!("Pushing {} {} entries", entries.len(), entity_type);

            // Records whose remaining entries must wait for a later cycle.
            let mut blocked: HashSet<RecordId> = HashSet::new();

            for entry in entries {
                if blocked.contains(&entry.record_id) {
                    report.held_back += 1;
                    continue;
                }

                let records = self.records.clone();
                let record_id = entry.record_id.clone();
                let in_conflict = blocking(move || records.get(entity_type, &record_id))
                    .await?
                    .is_some_and(|r| r.sync_state == SyncState::Conflict);
                if in_conflict {
                    debug!("Holding back {} {} until resolved", entity_type, entry.record_id);
                    blocked.insert(entry.record_id.clone());
                    report.held_back += 1;
                    continue;
                }

                match self.push_entry(&entry, &actor).await {
                    Ok(ack) => {
                        let records = self.records.clone();
                        let acked = entry.clone();
                        let (revision, acked_at) = (ack.revision, ack.updated_at);
                        let state =
                            blocking(move || records.acknowledge(&acked, revision, acked_at)).await?;
                        debug!(
                            "Pushed {} {} {} (revision {}, now {:?})",
                            entry.op, entity_type, entry.record_id, ack.revision, state
                        );
                        report.pushed += 1;
                    }
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        warn!(
                            "Remote rejected {} of {} {}: {}",
                            entry.op, entity_type, entry.record_id, e
                        );
                        blocked.insert(entry.record_id.clone());
                        report.rejected += 1;
                    }
                }
            }
        }

        Ok(())
    }

    async fn push_entry(&self, entry: &MutationEntry, actor: &Actor) -> Result<RemoteAck> {
        let write = RemoteWrite {
            entity_type: entry.entity_type,
            id: entry.record_id.clone(),
            payload: entry.decode_payload()?.to_value()?,
            actor: actor.clone(),
        };
        let account = &self.account;
        let remote = &self.remote;

        match entry.op {
            MutationOp::Create => self.calls.execute(|| remote.insert(account, write.clone())).await,
            MutationOp::Update => self.calls.execute(|| remote.update(account, write.clone())).await,
            MutationOp::Delete => self.calls.execute(|| remote.delete(account, write.clone())).await,
        }
    }

    /// Fetch remote changes past each type's cursor.
    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        let limit = self.config.pull_batch_size.max(1);

        for entity_type in EntityType::ALL {
            let cursors = self.cursors.clone();
            let mut cursor = blocking(move || cursors.get(entity_type)).await?;

            loop {
                let batch = self
                    .calls
                    .execute(|| self.remote.changes_since(&self.account, entity_type, cursor, limit))
                    .await?;
                if batch.changes.is_empty() {
                    break;
                }
                debug!(
                    "Pulled {} {} changes after cursor {}",
                    batch.changes.len(),
                    entity_type,
                    cursor
                );

                let ChangeBatch {
                    changes,
                    next_cursor,
                    has_more,
                } = batch;
                let records = self.records.clone();
                let audit = self.audit.clone();
                let tally = blocking(move || apply_batch(&records, &audit, &changes)).await?;
                report.pulled += tally.pulled;
                report.applied += tally.applied;
                report.conflicts += tally.conflicts;
                report.skipped_malformed += tally.skipped_malformed;

                // Only a fully processed batch moves the cursor.
                let cursors = self.cursors.clone();
                cursor = blocking(move || cursors.advance(entity_type, next_cursor)).await?;

                if !has_more {
                    break;
                }
            }
        }

        Ok(())
    }

    fn lock_status(&self) -> MutexGuard<'_, SyncStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run a store call on the blocking pool.
///
/// SQLite calls and record locks block the calling thread; async paths keep
/// them off the runtime workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(format!("store task failed: {}", e)))?
}

/// Apply one pulled page in feed order.
fn apply_batch(
    records: &RecordStore,
    audit: &AuditTrail,
    changes: &[RemoteChange],
) -> Result<SyncReport> {
    let mut tally = SyncReport::default();
    for change in changes {
        tally.pulled += 1;
        let incoming = match change.decode() {
            Ok(incoming) => incoming,
            Err(e @ Error::MalformedPayload { .. }) => {
                warn!("Skipping remote change {}: {}", change.seq, e);
                record_malformed(audit, change, &e)?;
                tally.skipped_malformed += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        match records.apply_remote(&incoming)? {
            ApplyOutcome::Applied => tally.applied += 1,
            ApplyOutcome::Conflicted => tally.conflicts += 1,
            ApplyOutcome::Converged | ApplyOutcome::Ignored => {}
        }
    }
    Ok(tally)
}

/// Leave a diagnostic audit entry for a change that could not be decoded.
fn record_malformed(audit: &AuditTrail, change: &RemoteChange, err: &Error) -> Result<()> {
    let entity_type = change.row.entity_type;
    let mut entry = NewAuditEntry::new(
        Actor::new("system", "sync"),
        AuditAction::Sync,
        ConnectivityMode::Online,
        format!("Skipped malformed remote change {}: {}", change.seq, err),
    )
    .with_snapshots(None, Some(change.row.payload.clone()));
    if let Ok(id) = RecordId::new(change.row.id.clone()) {
        entry = entry.with_record(entity_type, id);
    }
    audit.append(entry)?;
    Ok(())
}

#[async_trait]
impl<R: RemoteAuthority + ?Sized + 'static> SyncRunner for SyncEngine<R> {
    async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
        self.handle_trigger(trigger).await
    }

    async fn retry_at(&self) -> Option<DateTime<Utc>> {
        SyncEngine::retry_at(self)
    }
}

/// Moves the status through one cycle.
///
/// A cycle dropped before finishing (e.g. its task was aborted) returns the
/// phase to idle so later triggers are not refused.
struct CycleGuard<'a> {
    status: &'a Mutex<SyncStatus>,
    finished: bool,
}

impl<'a> CycleGuard<'a> {
    fn enter(status: &'a Mutex<SyncStatus>) -> Self {
        let guard = Self {
            status,
            finished: false,
        };
        guard.lock().phase = SyncPhase::Syncing;
        guard
    }

    fn lock(&self) -> MutexGuard<'a, SyncStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn succeed(&mut self, at: DateTime<Utc>) {
        let mut status = self.lock();
        status.phase = SyncPhase::Idle;
        status.last_error = None;
        status.last_synced_at = Some(at);
        status.consecutive_failures = 0;
        status.retry_at = None;
        self.finished = true;
    }

    fn fail(&mut self, err: &Error, config: &SyncConfig) -> DateTime<Utc> {
        let mut status = self.lock();
        status.consecutive_failures += 1;
        let delay = config.retry.delay_for_attempt(status.consecutive_failures - 1);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        let retry_at = now() + delay;

        status.phase = SyncPhase::ErrorBackoff;
        status.last_error = Some(err.to_string());
        status.retry_at = Some(retry_at);
        self.finished = true;
        retry_at
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut status = self.lock();
            if status.phase == SyncPhase::Syncing {
                status.phase = SyncPhase::Idle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerkeep_common::{
        Contact, ContactKind, EntityPayload, InventoryItem, IncomingChange, RecordVersion,
        ChangeKind,
    };
    use ledgerkeep_remote::MemoryRemote;
    use ledgerkeep_store::{AuditFilter, LocalWrite};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::retry::RetryConfig;

    fn account() -> AccountId {
        AccountId::new("shop-1").unwrap()
    }

    fn cashier() -> Actor {
        Actor::new("u-1", "cashier")
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_max_retries(0)
            .with_request_timeout(Duration::from_secs(2))
            .with_retry(RetryConfig::new(0).with_initial_delay(Duration::from_secs(60)))
    }

    fn item(stock: i64) -> EntityPayload {
        EntityPayload::Inventory(InventoryItem {
            name: "Rice 5kg".into(),
            sku: None,
            category: None,
            stock,
            unit_price: 7500,
            cost_price: None,
        })
    }

    fn offline_write() -> LocalWrite {
        LocalWrite::new(cashier(), ConnectivityMode::Offline)
    }

    fn setup(remote: &MemoryRemote, config: SyncConfig) -> (Arc<Database>, SyncEngine<MemoryRemote>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let engine =
            SyncEngine::new(Arc::new(remote.clone()), db.clone(), account(), cashier(), config)
                .unwrap();
        (db, engine)
    }

    #[tokio::test]
    async fn test_store_calls_run_off_the_runtime_thread() {
        let runtime_thread = std::thread::current().id();
        let store_thread = blocking(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(store_thread, runtime_thread);

        let err = blocking::<(), _>(|| panic!("store task crashed")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_push_acknowledges_and_marks_synced() {
        let remote = MemoryRemote::new();
        let (db, engine) = setup(&remote, config());
        let records = RecordStore::new(db, account());

        let id = RecordId::generate();
        records.put_local(id.clone(), item(10), &offline_write()).unwrap();

        let outcome = engine.sync().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.pushed, 1);

        let record = records.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.revision, 1);
        assert!(remote.row(&account(), EntityType::Inventory, &id).is_some());

        let status = engine.status().unwrap();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.pending_mutations, 0);
        assert!(status.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_enters_backoff_without_losing_writes() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let (db, engine) = setup(&remote, config());
        let records = RecordStore::new(db, account());

        let id = RecordId::generate();
        records.put_local(id.clone(), item(3), &offline_write()).unwrap();

        let err = engine.sync().await.unwrap_err();
        assert!(err.is_retryable());

        let status = engine.status().unwrap();
        assert_eq!(status.phase, SyncPhase::ErrorBackoff);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.pending_mutations, 1);
        assert!(status.last_error.is_some());
        assert!(status.retry_at.is_some());

        let record = records.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.payload, item(3));

        remote.set_online(true);
        engine.sync().await.unwrap();
        let record = records.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(engine.status().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_periodic_trigger_deferred_during_backoff() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let (_db, engine) = setup(&remote, config());

        assert!(engine.sync().await.is_err());
        remote.set_online(true);

        let outcome = engine.handle_trigger(SyncTrigger::Periodic).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Deferred);

        // Reconnect runs ahead of the deadline.
        let outcome = engine.handle_trigger(SyncTrigger::Reconnect).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));
        assert!(engine.retry_at().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_a_noop() {
        let remote = MemoryRemote::new();
        remote.set_latency(Some(Duration::from_millis(50)));
        let (db, engine) = setup(&remote, config());
        let records = RecordStore::new(db, account());
        records.put_local(RecordId::generate(), item(1), &offline_write()).unwrap();

        let (first, second) = tokio::join!(engine.sync(), engine.sync());
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes.iter().filter(|o| **o == SyncOutcome::AlreadyRunning).count(),
            1
        );
        assert_eq!(remote.writes_accepted(), 1);
    }

    #[tokio::test]
    async fn test_pull_pages_and_advances_cursor() {
        let remote = MemoryRemote::new();
        let (db, engine) = setup(&remote, config().with_pull_batch_size(2));
        let other = Actor::new("u-9", "manager");

        for n in 0..5 {
            remote
                .inject(
                    &account(),
                    EntityType::Contact,
                    &format!("c-{}", n),
                    json!({"name": format!("Customer {}", n), "kind": "customer"}),
                    Some(other.clone()),
                )
                .unwrap();
        }

        let outcome = engine.sync().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.pulled, 5);
        assert_eq!(report.applied, 5);

        let records = RecordStore::new(db.clone(), account());
        let contacts = records.list(EntityType::Contact, false).unwrap();
        assert_eq!(contacts.len(), 5);
        assert!(contacts.iter().all(|r| r.sync_state == SyncState::Synced));

        let cursors = CursorStore::new(db.clone(), account());
        assert_eq!(cursors.get(EntityType::Contact).unwrap(), 5);

        // Remote-origin changes are audited as the remote actor.
        let audit = AuditTrail::new(db, account());
        let entries: Vec<_> = audit
            .query(AuditFilter::default().actor("u-9"))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries.iter().all(|e| e.mode == ConnectivityMode::Online));

        // Nothing new: a second cycle pulls nothing.
        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.report().unwrap().pulled, 0);
    }

    #[tokio::test]
    async fn test_malformed_change_is_skipped_and_audited() {
        let remote = MemoryRemote::new();
        let (db, engine) = setup(&remote, config());

        remote
            .inject(&account(), EntityType::Contact, "c-bad", json!({"name": "X", "tier": 3}), None)
            .unwrap();
        remote
            .inject(
                &account(),
                EntityType::Contact,
                "c-good",
                json!({"name": "Ada", "kind": "supplier"}),
                None,
            )
            .unwrap();

        let outcome = engine.sync().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.skipped_malformed, 1);
        assert_eq!(report.applied, 1);

        let records = RecordStore::new(db.clone(), account());
        let bad = RecordId::new("c-bad").unwrap();
        assert!(records.get(EntityType::Contact, &bad).unwrap().is_none());

        let audit = AuditTrail::new(db.clone(), account());
        let diagnostics: Vec<_> = audit
            .query(AuditFilter::default().action(AuditAction::Sync))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].record_id, Some(bad));

        // The cursor moved past the malformed change.
        assert_eq!(CursorStore::new(db, account()).get(EntityType::Contact).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_conflict_records_are_held_back() {
        let remote = MemoryRemote::new();
        let (db, engine) = setup(&remote, config());
        let records = RecordStore::new(db, account());

        let id = RecordId::generate();
        records.put_local(id.clone(), item(10), &offline_write()).unwrap();
        engine.sync().await.unwrap();

        records.put_local(id.clone(), item(8), &offline_write()).unwrap();
        let base = records.get(EntityType::Inventory, &id).unwrap().unwrap().base.unwrap();
        let outcome = records
            .apply_remote(&IncomingChange {
                record_id: id.clone(),
                version: RecordVersion {
                    payload: item(5),
                    deleted: false,
                    updated_at: now(),
                    revision: base.revision + 1,
                },
                created_at: base.updated_at,
                kind: ChangeKind::Update,
                actor: Actor::new("u-2", "cashier"),
                seq: 99,
            })
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflicted);

        let writes_before = remote.writes_accepted();
        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.report().unwrap().held_back, 1);
        assert_eq!(remote.writes_accepted(), writes_before);

        let record = records.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Conflict);
        assert_eq!(record.payload, item(8));
    }

    #[tokio::test]
    async fn test_last_synced_at_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let remote = Arc::new(MemoryRemote::new());

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let engine =
                SyncEngine::new(remote.clone(), db, account(), cashier(), config()).unwrap();
            engine.sync().await.unwrap();
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let engine = SyncEngine::new(remote, db, account(), cashier(), config()).unwrap();
        assert!(engine.status().unwrap().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_push_uses_current_actor() {
        let remote = MemoryRemote::new();
        let (db, engine) = setup(&remote, config());
        let records = RecordStore::new(db, account());

        engine.set_actor(Actor::new("u-7", "owner")).await;
        let id = RecordId::generate();
        let contact = EntityPayload::Contact(Contact {
            name: "Bola".into(),
            kind: ContactKind::Customer,
            phone: None,
            email: None,
        });
        records.put_local(id.clone(), contact, &offline_write()).unwrap();
        engine.sync().await.unwrap();

        let row = remote.row(&account(), EntityType::Contact, &id).unwrap();
        assert_eq!(row.actor.unwrap().id, "u-7");
    }
}
