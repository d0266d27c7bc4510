//! Local application API over one device's replica.
//!
//! Every call completes against the local database only; network activity
//! happens in [`crate::LedgerSync`]. Writes are audited with the connectivity
//! mode in effect when they were made.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use ledgerkeep_common::{
    AccountId, Actor, ConnectivityMode, EntityPayload, EntityType, Error, Record, RecordId,
    Result, SyncState,
};
use ledgerkeep_store::{
    AuditAction, AuditEntry, AuditFilter, AuditQuery, AuditTrail, ConflictChoice, ConflictInfo,
    Database, LocalWrite, MutationLog, NewAuditEntry, RecordStore,
};

use crate::config::LedgerConfig;

/// One account's local ledger.
pub struct Ledger {
    db: Arc<Database>,
    records: RecordStore,
    mutations: MutationLog,
    audit: AuditTrail,
    actor: RwLock<Actor>,
    /// Shared with the sync attachment.
    online: Arc<AtomicBool>,
    /// Signalled after every committed local write.
    local_changes: Arc<Notify>,
}

impl Ledger {
    /// Open (or create) the replica described by `config`.
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let db = Database::open(&config.database_path)?;
        info!("Opened ledger at {}", config.database_path.display());
        Ok(Self::new(Arc::new(db), config.account()?, config.actor.clone()))
    }

    /// Wrap an already opened database. The ledger starts offline.
    pub fn new(db: Arc<Database>, account: AccountId, actor: Actor) -> Self {
        Self {
            records: RecordStore::new(db.clone(), account.clone()),
            mutations: MutationLog::new(db.clone(), account.clone()),
            audit: AuditTrail::new(db.clone(), account),
            db,
            actor: RwLock::new(actor),
            online: Arc::new(AtomicBool::new(false)),
            local_changes: Arc::new(Notify::new()),
        }
    }

    pub fn account(&self) -> &AccountId {
        self.records.account()
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn actor(&self) -> Actor {
        self.actor.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Connectivity mode stamped on new audit entries.
    pub fn mode(&self) -> ConnectivityMode {
        if self.online.load(Ordering::SeqCst) {
            ConnectivityMode::Online
        } else {
            ConnectivityMode::Offline
        }
    }

    pub(crate) fn online_flag(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }

    pub(crate) fn local_changes(&self) -> Arc<Notify> {
        self.local_changes.clone()
    }

    fn local_write(&self) -> LocalWrite {
        LocalWrite::new(self.actor(), self.mode())
    }

    fn changed(&self) {
        self.local_changes.notify_one();
    }

    /// Create a record under a fresh id.
    pub fn create(&self, payload: EntityPayload) -> Result<Record> {
        self.write(RecordId::generate(), payload)
    }

    /// Insert or overwrite a record.
    ///
    /// The record becomes `pending` (or stays `conflict`); a mutation log
    /// entry and an audit entry are written in the same transaction.
    ///
    /// # Errors
    /// - `InvalidInput` if the payload fails validation
    /// - `NotFound` if the record was deleted
    /// - `Storage` if the write could not be committed; nothing is kept
    pub fn write(&self, id: RecordId, payload: EntityPayload) -> Result<Record> {
        let record = self.records.put_local(id, payload, &self.local_write())?;
        self.changed();
        Ok(record)
    }

    /// Delete a record (tombstone).
    pub fn remove(&self, entity_type: EntityType, id: &RecordId) -> Result<Record> {
        let record = self.records.delete_local(entity_type, id, &self.local_write())?;
        self.changed();
        Ok(record)
    }

    /// Read a live record.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist or was deleted
    pub fn read(&self, entity_type: EntityType, id: &RecordId) -> Result<Record> {
        self.records
            .get(entity_type, id)?
            .filter(|r| !r.deleted)
            .ok_or_else(|| Error::NotFound(format!("{} record {}", entity_type, id)))
    }

    /// All live records of a type.
    pub fn query(&self, entity_type: EntityType) -> Result<Vec<Record>> {
        self.records.list(entity_type, false)
    }

    /// Records of a type in one sync state, tombstones included.
    pub fn query_by_state(&self, entity_type: EntityType, state: SyncState) -> Result<Vec<Record>> {
        self.records.list_by_state(entity_type, state)
    }

    /// Lazily page through the audit trail, oldest first.
    pub fn audit_query(&self, filter: AuditFilter) -> AuditQuery {
        self.audit.query(filter)
    }

    /// Apply a payment to a receivable.
    ///
    /// # Errors
    /// - `InvalidInput` if the amount is not positive or exceeds the balance
    /// - `NotFound` if the receivable does not exist
    pub fn record_payment(&self, receivable_id: &RecordId, amount: i64) -> Result<Record> {
        let write = self.local_write().with_action(AuditAction::Payment);
        let record = self.records.update_local(
            EntityType::Receivable,
            receivable_id,
            write,
            |payload, write| {
                let EntityPayload::Receivable(receivable) = payload else {
                    return Err(Error::Storage(format!(
                        "receivable {} holds a foreign payload",
                        receivable_id
                    )));
                };
                receivable.apply_payment(amount)?;
                write.description = Some(format!(
                    "Payment of {} on receivable {} (balance {})",
                    amount,
                    receivable_id,
                    receivable.balance()
                ));
                Ok(())
            },
        )?;
        debug!("Recorded payment of {} on {}", amount, receivable_id);
        self.changed();
        Ok(record)
    }

    /// Append a session event (login, logout, role change) to the audit trail.
    pub fn record_session_event(
        &self,
        action: AuditAction,
        description: impl Into<String>,
    ) -> Result<AuditEntry> {
        if !matches!(
            action,
            AuditAction::Login | AuditAction::Logout | AuditAction::RoleChange
        ) {
            return Err(Error::InvalidInput(format!(
                "{} is not a session event",
                action
            )));
        }
        self.audit
            .append(NewAuditEntry::new(self.actor(), action, self.mode(), description))
    }

    /// Sign a user in and audit it.
    pub fn login(&self, actor: Actor) -> Result<AuditEntry> {
        let description = format!("{} signed in as {}", actor.id, actor.role);
        *self.actor.write().unwrap_or_else(|e| e.into_inner()) = actor;
        self.record_session_event(AuditAction::Login, description)
    }

    /// Audit the current user signing out.
    pub fn logout(&self) -> Result<AuditEntry> {
        let actor = self.actor();
        self.record_session_event(AuditAction::Logout, format!("{} signed out", actor.id))
    }

    /// Change the current user's role and audit it.
    pub fn change_role(&self, role: impl Into<String>) -> Result<AuditEntry> {
        let role = role.into();
        let previous = {
            let mut actor = self.actor.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut actor.role, role.clone())
        };
        self.record_session_event(
            AuditAction::RoleChange,
            format!("Role changed from {} to {}", previous, role),
        )
    }

    /// Records of a type waiting for operator resolution.
    pub fn conflicts(&self, entity_type: EntityType) -> Result<Vec<ConflictInfo>> {
        self.records.conflicts(entity_type)
    }

    /// Settle a conflict by keeping the local or taking the remote version.
    pub fn resolve_conflict(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        choice: ConflictChoice,
    ) -> Result<Record> {
        let record = self
            .records
            .resolve_conflict(entity_type, id, choice, &self.local_write())?;
        info!("Resolved conflict on {} {} ({:?})", entity_type, id, choice);
        if record.sync_state == SyncState::Pending {
            self.changed();
        }
        Ok(record)
    }

    /// Unacknowledged local writes.
    pub fn pending_count(&self) -> Result<u64> {
        self.mutations.pending_count()
    }

    /// Drop acknowledged mutation log entries older than `older_than`.
    pub fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.mutations.prune_synced(older_than)
    }
}
