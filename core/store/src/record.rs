//! Canonical local copy of business records.
//!
//! Writes come from two origins. Local writes (`put_local`, `delete_local`)
//! mark the record `pending` and append a mutation log entry and an audit
//! entry in the same transaction. Remote writes (`apply_remote`) go through
//! the conflict resolver and may leave the record `synced` or `conflict`.
//! Both paths take the record's lock first, so the sync engine's pull and
//! the live change channel never interleave on one record.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ledgerkeep_common::{
    now, AccountId, Actor, ChangeKind, ConnectivityMode, EntityPayload, EntityType, Error,
    IncomingChange, Record, RecordId, RecordVersion, Result, SyncState,
};

use crate::audit::{self, AuditAction, NewAuditEntry};
use crate::conflict::{ConflictChoice, ConflictInfo, ConflictResolver, Resolution};
use crate::db::{from_millis, storage_error, to_millis, Database};
use crate::mutation::{self, MutationEntry, MutationOp, NewMutation, Outcome};

const COLUMNS: &str =
    "id, account_id, payload, deleted, created_at, updated_at, revision, sync_state, base, remote";

/// Who performs a local write and how it is audited.
#[derive(Debug, Clone)]
pub struct LocalWrite {
    pub actor: Actor,
    pub mode: ConnectivityMode,
    /// Audit action override (e.g. `Payment`); derived from the operation
    /// when unset.
    pub action: Option<AuditAction>,
    pub description: Option<String>,
}

impl LocalWrite {
    pub fn new(actor: Actor, mode: ConnectivityMode) -> Self {
        Self {
            actor,
            mode,
            action: None,
            description: None,
        }
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn audit(&self, default_action: AuditAction, default_description: String) -> NewAuditEntry {
        NewAuditEntry::new(
            self.actor.clone(),
            self.action.unwrap_or(default_action),
            self.mode,
            self.description.clone().unwrap_or(default_description),
        )
    }
}

/// What happened to an incoming remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Remote content replaced local content.
    Applied,
    /// Local already held the remote content; only bookkeeping moved.
    Converged,
    /// Diverging edits; the record is now (or remains) in conflict.
    Conflicted,
    /// Stale or re-delivered change; nothing changed.
    Ignored,
}

/// Per-account view of the record tables.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
    account: AccountId,
}

impl RecordStore {
    pub fn new(db: Arc<Database>, account: AccountId) -> Self {
        Self { db, account }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Get a record, tombstones included.
    pub fn get(&self, entity_type: EntityType, id: &RecordId) -> Result<Option<Record>> {
        self.db
            .read(|conn| select(conn, entity_type, &self.account, id))
    }

    /// All records of a type, oldest first.
    pub fn list(&self, entity_type: EntityType, include_deleted: bool) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE account_id = ?1 AND (?2 OR deleted = 0)
             ORDER BY created_at ASC, id ASC",
            entity_type.table()
        );
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(storage_error)?;
            let raw = stmt
                .query_map(params![self.account.as_str(), include_deleted], RawRecord::from_row)
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            raw.into_iter().map(|r| r.decode(entity_type)).collect()
        })
    }

    /// Records of a type in one sync state.
    pub fn list_by_state(&self, entity_type: EntityType, state: SyncState) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE account_id = ?1 AND sync_state = ?2
             ORDER BY updated_at ASC, id ASC",
            entity_type.table()
        );
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(storage_error)?;
            let raw = stmt
                .query_map(params![self.account.as_str(), state.as_str()], RawRecord::from_row)
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            raw.into_iter().map(|r| r.decode(entity_type)).collect()
        })
    }

    /// Number of records in `state` across all entity types.
    pub fn count_by_state(&self, state: SyncState) -> Result<u64> {
        self.db.read(|conn| {
            let mut total = 0u64;
            for entity_type in EntityType::ALL {
                let sql = format!(
                    "SELECT COUNT(*) FROM {} WHERE account_id = ?1 AND sync_state = ?2",
                    entity_type.table()
                );
                let n: i64 = conn
                    .query_row(&sql, params![self.account.as_str(), state.as_str()], |row| row.get(0))
                    .map_err(storage_error)?;
                total += n as u64;
            }
            Ok(total)
        })
    }

    /// Records currently in conflict, with both versions.
    pub fn conflicts(&self, entity_type: EntityType) -> Result<Vec<ConflictInfo>> {
        Ok(self
            .list_by_state(entity_type, SyncState::Conflict)?
            .iter()
            .filter_map(ConflictInfo::from_record)
            .collect())
    }

    /// Insert or overwrite a record from a local write.
    ///
    /// The record write, its mutation log entry and its audit entry commit
    /// together or not at all.
    ///
    /// # Errors
    /// - `InvalidInput` if the payload fails validation
    /// - `NotFound` if the record was deleted
    /// - `Storage` if any of the three writes fails
    pub fn put_local(
        &self,
        id: RecordId,
        payload: EntityPayload,
        write: &LocalWrite,
    ) -> Result<Record> {
        payload.validate()?;
        let entity_type = payload.entity_type();

        self.db.locks().with(entity_type, &id, || {
            self.db.transaction(|conn| {
                let existing = select(conn, entity_type, &self.account, &id)?;
                self.write_local(conn, existing, id.clone(), payload.clone(), write)
            })
        })
    }

    /// Read-modify-write of a live record under its lock.
    ///
    /// `update` sees the current payload and may adjust the audit details;
    /// the result is written like [`put_local`](Self::put_local). Concurrent
    /// updates of one record apply one after the other, never from the same
    /// stale read.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist or was deleted
    /// - any error returned by `update`, in which case nothing is written
    pub fn update_local(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        write: LocalWrite,
        update: impl FnOnce(&mut EntityPayload, &mut LocalWrite) -> Result<()>,
    ) -> Result<Record> {
        self.db.locks().with(entity_type, id, || {
            self.db.transaction(|conn| {
                let current = select(conn, entity_type, &self.account, id)?
                    .filter(|r| !r.deleted)
                    .ok_or_else(|| Error::NotFound(format!("{} record {}", entity_type, id)))?;

                let mut payload = current.payload.clone();
                let mut write = write;
                update(&mut payload, &mut write)?;
                if payload.entity_type() != entity_type {
                    return Err(Error::InvalidInput(format!(
                        "update of {} record {} changed its entity type",
                        entity_type, id
                    )));
                }
                payload.validate()?;

                self.write_local(conn, Some(current), id.clone(), payload, &write)
            })
        })
    }

    /// Write a local version inside the caller's lock and transaction.
    fn write_local(
        &self,
        conn: &Connection,
        existing: Option<Record>,
        id: RecordId,
        payload: EntityPayload,
        write: &LocalWrite,
    ) -> Result<Record> {
        let entity_type = payload.entity_type();
        let at = now();

        let (record, op) = match &existing {
            None => (
                Record {
                    id: id.clone(),
                    account_id: self.account.clone(),
                    payload: payload.clone(),
                    deleted: false,
                    created_at: at,
                    updated_at: at,
                    revision: 0,
                    sync_state: SyncState::Pending,
                    base: None,
                    remote: None,
                },
                MutationOp::Create,
            ),
            Some(current) if current.deleted => {
                return Err(Error::NotFound(format!(
                    "{} record {} was deleted",
                    entity_type, id
                )));
            }
            Some(current) => (
                Record {
                    payload: payload.clone(),
                    updated_at: at,
                    sync_state: after_local_write(current.sync_state),
                    ..current.clone()
                },
                MutationOp::Update,
            ),
        };

        write_record(conn, &record)?;
        mutation::insert(
            conn,
            &self.account,
            &NewMutation {
                entity_type,
                record_id: id.clone(),
                op,
                payload: payload.to_json()?,
            },
        )?;

        let (action, verb) = match op {
            MutationOp::Create => (AuditAction::Create, "Created"),
            _ => (AuditAction::Update, "Updated"),
        };
        let before = existing.as_ref().map(|r| snapshot(&r.current_version())).transpose()?.flatten();
        audit::insert(
            conn,
            &self.account,
            &write
                .audit(action, format!("{} {} record {}", verb, entity_type, id))
                .with_record(entity_type, id.clone())
                .with_snapshots(before, Some(payload.to_value()?)),
        )?;

        debug!("Local {} of {} {}", op, entity_type, id);
        Ok(record)
    }

    /// Tombstone a record from a local write.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist or is already deleted
    pub fn delete_local(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        write: &LocalWrite,
    ) -> Result<Record> {
        self.db.locks().with(entity_type, id, || {
            self.db.transaction(|conn| {
                let current = select(conn, entity_type, &self.account, id)?
                    .filter(|r| !r.deleted)
                    .ok_or_else(|| Error::NotFound(format!("{} record {}", entity_type, id)))?;

                let record = Record {
                    deleted: true,
                    updated_at: now(),
                    sync_state: after_local_write(current.sync_state),
                    ..current.clone()
                };

                write_record(conn, &record)?;
                mutation::insert(
                    conn,
                    &self.account,
                    &NewMutation {
                        entity_type,
                        record_id: id.clone(),
                        op: MutationOp::Delete,
                        payload: record.payload.to_json()?,
                    },
                )?;
                audit::insert(
                    conn,
                    &self.account,
                    &write
                        .audit(AuditAction::Delete, format!("Deleted {} record {}", entity_type, id))
                        .with_record(entity_type, id.clone())
                        .with_snapshots(snapshot(&current.current_version())?, None),
                )?;

                debug!("Local delete of {} {}", entity_type, id);
                Ok(record)
            })
        })
    }

    /// Apply a change observed at the remote authority.
    ///
    /// Used by both the pull and the live channel. Applied and conflicted
    /// changes produce one audit entry attributed to the remote actor;
    /// converged and ignored changes produce none.
    pub fn apply_remote(&self, change: &IncomingChange) -> Result<ApplyOutcome> {
        let entity_type = change.entity_type();
        let id = &change.record_id;
        let remote = &change.version;

        self.db.locks().with(entity_type, id, || {
            self.db.transaction(|conn| {
                let Some(mut record) = select(conn, entity_type, &self.account, id)? else {
                    if remote.deleted {
                        return Ok(ApplyOutcome::Ignored);
                    }
                    let record = Record {
                        id: id.clone(),
                        account_id: self.account.clone(),
                        payload: remote.payload.clone(),
                        deleted: false,
                        created_at: change.created_at,
                        updated_at: remote.updated_at,
                        revision: remote.revision,
                        sync_state: SyncState::Synced,
                        base: Some(remote.clone()),
                        remote: None,
                    };
                    write_record(conn, &record)?;
                    self.audit_remote(
                        conn,
                        change,
                        AuditAction::Create,
                        None,
                        format!("Remote insert of {} record {}", entity_type, id),
                    )?;
                    return Ok(ApplyOutcome::Applied);
                };

                let local = record.current_version();
                let state = record.sync_state;
                let outcome = match state {
                    SyncState::Synced => {
                        let base = record.base.clone().unwrap_or_else(|| local.clone());
                        match ConflictResolver::resolve(Some(&base), &local, remote) {
                            Resolution::RemoteWins => {
                                adopt(&mut record, remote);
                                ApplyOutcome::Applied
                            }
                            _ if local.same_content(remote) && remote.is_newer_than(&base) => {
                                converge(&mut record, remote);
                                ApplyOutcome::Converged
                            }
                            _ => ApplyOutcome::Ignored,
                        }
                    }
                    SyncState::Pending if absorb_echo(conn, &self.account, &mut record, remote)? => {
                        debug!(
                            "Remote revision {} of {} {} carries our own queued write",
                            remote.revision, entity_type, id
                        );
                        ApplyOutcome::Converged
                    }
                    SyncState::Pending => {
                        match ConflictResolver::resolve(record.base.as_ref(), &local, remote) {
                            Resolution::RemoteWins => {
                                mutation::discard_for_record(conn, &self.account, entity_type, id)?;
                                adopt(&mut record, remote);
                                ApplyOutcome::Applied
                            }
                            Resolution::LocalWins
                                if local.same_content(remote)
                                    && record.base.as_ref().is_none_or(|b| remote.is_newer_than(b)) =>
                            {
                                mutation::discard_for_record(conn, &self.account, entity_type, id)?;
                                converge(&mut record, remote);
                                ApplyOutcome::Converged
                            }
                            Resolution::LocalWins => ApplyOutcome::Ignored,
                            Resolution::Manual => {
                                record.sync_state = SyncState::Conflict;
                                record.remote = Some(remote.clone());
                                ApplyOutcome::Conflicted
                            }
                        }
                    }
                    SyncState::Conflict => {
                        if local.same_content(remote) {
                            mutation::discard_for_record(conn, &self.account, entity_type, id)?;
                            converge(&mut record, remote);
                            ApplyOutcome::Converged
                        } else if record.remote.as_ref().is_none_or(|r| remote.is_newer_than(r)) {
                            record.remote = Some(remote.clone());
                            ApplyOutcome::Conflicted
                        } else {
                            ApplyOutcome::Ignored
                        }
                    }
                };

                match outcome {
                    ApplyOutcome::Ignored => {
                        debug!("Ignored stale remote change to {} {}", entity_type, id);
                    }
                    ApplyOutcome::Converged => {
                        write_record(conn, &record)?;
                        debug!("Remote change to {} {} matches local content", entity_type, id);
                    }
                    ApplyOutcome::Applied => {
                        write_record(conn, &record)?;
                        let action = if remote.deleted {
                            AuditAction::Delete
                        } else if local.deleted {
                            AuditAction::Create
                        } else {
                            AuditAction::Update
                        };
                        self.audit_remote(
                            conn,
                            change,
                            action,
                            snapshot(&local)?,
                            format!("Remote {} of {} record {}", kind_label(change.kind), entity_type, id),
                        )?;
                    }
                    ApplyOutcome::Conflicted => {
                        write_record(conn, &record)?;
                        let mut fields = local.payload.changed_fields(&remote.payload);
                        if local.deleted != remote.deleted {
                            fields.push("deleted".to_string());
                        }
                        warn!(
                            "Conflict on {} {}: fields [{}] changed on both sides",
                            entity_type,
                            id,
                            fields.join(", ")
                        );
                        self.audit_remote(
                            conn,
                            change,
                            if remote.deleted { AuditAction::Delete } else { AuditAction::Update },
                            snapshot(&local)?,
                            format!(
                                "Conflicting remote {} of {} record {} (fields: {})",
                                kind_label(change.kind),
                                entity_type,
                                id,
                                fields.join(", ")
                            ),
                        )?;
                    }
                }

                Ok(outcome)
            })
        })
    }

    /// Record the remote authority's acknowledgement of a pushed entry.
    ///
    /// Marks the entry synced and moves the record's base to the pushed
    /// content. The record becomes `synced` only if it is still `pending`
    /// and no newer local edit is queued. Returns `None` if the entry had
    /// already left the queue.
    pub fn acknowledge(
        &self,
        entry: &MutationEntry,
        revision: u64,
        acked_at: DateTime<Utc>,
    ) -> Result<Option<SyncState>> {
        let pushed = RecordVersion {
            payload: entry.decode_payload()?,
            deleted: entry.op == MutationOp::Delete,
            updated_at: acked_at,
            revision,
        };

        self.db.locks().with(entry.entity_type, &entry.record_id, || {
            self.db.transaction(|conn| {
                if !mutation::mark(conn, &entry.id, Outcome::Acked)? {
                    return Ok(None);
                }
                let Some(mut record) =
                    select(conn, entry.entity_type, &self.account, &entry.record_id)?
                else {
                    return Ok(None);
                };

                if record.sync_state == SyncState::Pending
                    && record.base.as_ref().is_none_or(|b| b.revision <= revision)
                {
                    let newer = mutation::has_unsynced(
                        conn,
                        &self.account,
                        entry.entity_type,
                        &entry.record_id,
                    )?;
                    record.base = Some(pushed.clone());
                    record.revision = revision;
                    if !newer && record.current_version().same_content(&pushed) {
                        record.sync_state = SyncState::Synced;
                    }
                    write_record(conn, &record)?;
                }

                Ok(Some(record.sync_state))
            })
        })
    }

    /// Settle a record in conflict by operator decision.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist
    /// - `Conflict` if the record is not in conflict
    pub fn resolve_conflict(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        choice: ConflictChoice,
        write: &LocalWrite,
    ) -> Result<Record> {
        self.db.locks().with(entity_type, id, || {
            self.db.transaction(|conn| {
                let mut record = select(conn, entity_type, &self.account, id)?
                    .ok_or_else(|| Error::NotFound(format!("{} record {}", entity_type, id)))?;
                if record.sync_state != SyncState::Conflict {
                    return Err(Error::Conflict(format!(
                        "{} record {} is not in conflict",
                        entity_type, id
                    )));
                }
                let remote = record.remote.take().ok_or_else(|| {
                    Error::Storage(format!("{} record {} has no retained remote version", entity_type, id))
                })?;

                let local = record.current_version();
                mutation::discard_for_record(conn, &self.account, entity_type, id)?;

                let (after, label) = match choice {
                    ConflictChoice::KeepLocal => {
                        record.base = Some(remote.clone());
                        record.revision = remote.revision;
                        record.sync_state = SyncState::Pending;
                        mutation::insert(
                            conn,
                            &self.account,
                            &NewMutation {
                                entity_type,
                                record_id: id.clone(),
                                op: if record.deleted { MutationOp::Delete } else { MutationOp::Update },
                                payload: record.payload.to_json()?,
                            },
                        )?;
                        (snapshot(&local)?, "kept local version")
                    }
                    ConflictChoice::TakeRemote => {
                        adopt(&mut record, &remote);
                        (snapshot(&remote)?, "took remote version")
                    }
                };

                write_record(conn, &record)?;
                audit::insert(
                    conn,
                    &self.account,
                    &write
                        .audit(
                            AuditAction::Update,
                            format!("Resolved conflict on {} record {}: {}", entity_type, id, label),
                        )
                        .with_record(entity_type, id.clone())
                        .with_snapshots(snapshot(&local)?, after),
                )?;

                info!("Resolved conflict on {} {}: {}", entity_type, id, label);
                Ok(record)
            })
        })
    }

    fn audit_remote(
        &self,
        conn: &Connection,
        change: &IncomingChange,
        action: AuditAction,
        before: Option<Value>,
        description: String,
    ) -> Result<()> {
        let entry = NewAuditEntry::new(change.actor.clone(), action, ConnectivityMode::Online, description)
            .with_record(change.entity_type(), change.record_id.clone())
            .with_snapshots(before, snapshot(&change.version)?);
        audit::insert(conn, &self.account, &entry)?;
        Ok(())
    }
}

fn after_local_write(state: SyncState) -> SyncState {
    match state {
        SyncState::Conflict => SyncState::Conflict,
        _ => SyncState::Pending,
    }
}

/// Treat a remote version carrying a queued write's content as its echo.
///
/// If queued entry k holds the remote content, entries up to k are
/// acknowledged and the base moves to the remote version. The record turns
/// `synced` only when nothing newer is left queued. Returns `false` (and
/// changes nothing) when no queued entry matches.
fn absorb_echo(
    conn: &Connection,
    account: &AccountId,
    record: &mut Record,
    remote: &RecordVersion,
) -> Result<bool> {
    if record.base.as_ref().is_some_and(|b| !remote.is_newer_than(b)) {
        return Ok(false);
    }
    let entries = mutation::unsynced_for_record(conn, account, record.entity_type(), &record.id)?;

    let mut matched = None;
    for (k, entry) in entries.iter().enumerate() {
        let deleted = entry.op == MutationOp::Delete;
        if deleted == remote.deleted && entry.decode_payload()? == remote.payload {
            matched = Some(k);
            break;
        }
    }
    let Some(k) = matched else {
        return Ok(false);
    };

    for entry in &entries[..=k] {
        mutation::mark(conn, &entry.id, Outcome::Acked)?;
    }
    if k + 1 == entries.len() && record.current_version().same_content(remote) {
        converge(record, remote);
    } else {
        record.base = Some(remote.clone());
        record.revision = remote.revision;
    }
    Ok(true)
}

/// Replace local content with a remote version and mark it synced.
fn adopt(record: &mut Record, remote: &RecordVersion) {
    record.payload = remote.payload.clone();
    record.deleted = remote.deleted;
    record.updated_at = remote.updated_at;
    converge(record, remote);
}

/// Local content already equals `remote`; move bookkeeping to it.
fn converge(record: &mut Record, remote: &RecordVersion) {
    record.revision = remote.revision;
    record.base = Some(remote.clone());
    record.remote = None;
    record.sync_state = SyncState::Synced;
}

fn snapshot(version: &RecordVersion) -> Result<Option<Value>> {
    if version.deleted {
        return Ok(None);
    }
    Ok(Some(version.payload.to_value()?))
}

fn kind_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Insert => "insert",
        ChangeKind::Update => "update",
        ChangeKind::Delete => "delete",
    }
}

struct RawRecord {
    id: String,
    account_id: String,
    payload: String,
    deleted: bool,
    created_at: i64,
    updated_at: i64,
    revision: i64,
    sync_state: String,
    base: Option<String>,
    remote: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            payload: row.get(2)?,
            deleted: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            revision: row.get(6)?,
            sync_state: row.get(7)?,
            base: row.get(8)?,
            remote: row.get(9)?,
        })
    }

    fn decode(self, entity_type: EntityType) -> Result<Record> {
        let version = |json: Option<String>| {
            json.map(|j| RecordVersion::from_json(entity_type, &self.id, &j))
                .transpose()
        };
        let base = version(self.base.clone())?;
        let remote = version(self.remote.clone())?;

        Ok(Record {
            payload: EntityPayload::from_json(entity_type, &self.id, &self.payload)?,
            id: RecordId::new(self.id)?,
            account_id: AccountId::new(self.account_id)?,
            deleted: self.deleted,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            revision: self.revision as u64,
            sync_state: self.sync_state.parse()?,
            base,
            remote,
        })
    }
}

fn select(
    conn: &Connection,
    entity_type: EntityType,
    account: &AccountId,
    id: &RecordId,
) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM {} WHERE id = ?1 AND account_id = ?2",
        entity_type.table()
    );
    conn.query_row(&sql, params![id.as_str(), account.as_str()], RawRecord::from_row)
        .optional()
        .map_err(storage_error)?
        .map(|raw| raw.decode(entity_type))
        .transpose()
}

fn write_record(conn: &Connection, record: &Record) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        record.entity_type().table()
    );
    let base = record.base.as_ref().map(|v| v.to_json()).transpose()?;
    let remote = record.remote.as_ref().map(|v| v.to_json()).transpose()?;

    conn.execute(
        &sql,
        params![
            record.id.as_str(),
            record.account_id.as_str(),
            record.payload.to_json()?,
            record.deleted,
            to_millis(record.created_at),
            to_millis(record.updated_at),
            record.revision as i64,
            record.sync_state.as_str(),
            base,
            remote,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditTrail};
    use crate::mutation::MutationLog;
    use chrono::Duration;
    use ledgerkeep_common::InventoryItem;
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        store: RecordStore,
        log: MutationLog,
        audit: AuditTrail,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let account = AccountId::new("shop-1").unwrap();
        Fixture {
            store: RecordStore::new(db.clone(), account.clone()),
            log: MutationLog::new(db.clone(), account.clone()),
            audit: AuditTrail::new(db.clone(), account),
            db,
        }
    }

    fn cashier(mode: ConnectivityMode) -> LocalWrite {
        LocalWrite::new(Actor::new("u-7", "cashier"), mode)
    }

    fn item(stock: i64, price: i64) -> EntityPayload {
        EntityPayload::Inventory(InventoryItem {
            name: "Cooking oil 1L".into(),
            sku: Some("OIL-1".into()),
            category: Some("groceries".into()),
            stock,
            unit_price: price,
            cost_price: None,
        })
    }

    fn change(id: &RecordId, payload: EntityPayload, revision: u64, kind: ChangeKind) -> IncomingChange {
        IncomingChange {
            record_id: id.clone(),
            version: RecordVersion {
                payload,
                deleted: kind == ChangeKind::Delete,
                updated_at: now() + Duration::milliseconds(revision as i64),
                revision,
            },
            created_at: now(),
            kind,
            actor: Actor::new("u-2", "owner"),
            seq: revision,
        }
    }

    /// A record that went out and came back acknowledged at revision 1.
    fn synced(fx: &Fixture, stock: i64, price: i64) -> RecordId {
        let id = RecordId::generate();
        fx.store
            .put_local(id.clone(), item(stock, price), &cashier(ConnectivityMode::Online))
            .unwrap();
        let entry = fx.log.pending(EntityType::Inventory).unwrap().remove(0);
        assert_eq!(
            fx.store.acknowledge(&entry, 1, now()).unwrap(),
            Some(SyncState::Synced)
        );
        id
    }

    #[test]
    fn test_local_write_is_pending_queued_and_audited() {
        let fx = fixture();
        let id = RecordId::generate();
        let record = fx
            .store
            .put_local(id.clone(), item(10, 100), &cashier(ConnectivityMode::Offline))
            .unwrap();

        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(fx.store.get(EntityType::Inventory, &id).unwrap(), Some(record));

        let pending = fx.log.pending(EntityType::Inventory).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, MutationOp::Create);

        let audit: Vec<_> = fx.audit.query(AuditFilter::default()).collect::<Result<_>>().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Create);
        assert_eq!(audit[0].mode, ConnectivityMode::Offline);
        assert!(audit[0].before.is_none());
    }

    #[test]
    fn test_invalid_payload_writes_nothing() {
        let fx = fixture();
        let result = fx.store.put_local(
            RecordId::generate(),
            item(1, -5),
            &cashier(ConnectivityMode::Online),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(fx.log.pending_count().unwrap(), 0);
        assert_eq!(fx.audit.count().unwrap(), 0);
    }

    #[test]
    fn test_audit_failure_aborts_the_whole_write() {
        let fx = fixture();
        fx.db
            .execute_batch(
                "CREATE TRIGGER fail_audit BEFORE INSERT ON audit_trail
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let id = RecordId::generate();
        let result = fx
            .store
            .put_local(id.clone(), item(10, 100), &cashier(ConnectivityMode::Online));

        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(fx.store.get(EntityType::Inventory, &id).unwrap().is_none());
        assert_eq!(fx.log.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_ack_marks_synced_only_without_newer_edits() {
        let fx = fixture();
        let id = RecordId::generate();
        let write = cashier(ConnectivityMode::Online);
        fx.store.put_local(id.clone(), item(10, 100), &write).unwrap();
        fx.store.put_local(id.clone(), item(9, 100), &write).unwrap();

        let pending = fx.log.pending(EntityType::Inventory).unwrap();
        assert_eq!(fx.store.acknowledge(&pending[0], 1, now()).unwrap(), Some(SyncState::Pending));
        assert_eq!(fx.store.acknowledge(&pending[1], 2, now()).unwrap(), Some(SyncState::Synced));

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.revision, 2);
        assert!(record.base.as_ref().unwrap().same_content(&record.current_version()));

        // Replayed acknowledgement is a no-op.
        assert_eq!(fx.store.acknowledge(&pending[1], 2, now()).unwrap(), None);
    }

    #[test]
    fn test_remote_change_on_synced_record_is_applied() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let before = fx.audit.count().unwrap();

        let outcome = fx
            .store
            .apply_remote(&change(&id, item(10, 120), 2, ChangeKind::Update))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.payload, item(10, 120));
        assert_eq!(record.sync_state, SyncState::Synced);

        let entries: Vec<_> = fx
            .audit
            .query(AuditFilter::default().actor("u-2"))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(fx.audit.count().unwrap(), before + 1);
        assert_eq!(entries[0].mode, ConnectivityMode::Online);
        assert_eq!(entries[0].actor.role, "owner");
    }

    #[test]
    fn test_diverging_remote_change_conflicts_and_keeps_local_visible() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        fx.store
            .put_local(id.clone(), item(8, 100), &cashier(ConnectivityMode::Offline))
            .unwrap();

        let outcome = fx
            .store
            .apply_remote(&change(&id, item(5, 100), 2, ChangeKind::Update))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflicted);

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Conflict);
        assert_eq!(record.payload, item(8, 100));
        assert_eq!(record.remote.as_ref().unwrap().payload, item(5, 100));

        let conflicts = fx.store.conflicts(EntityType::Inventory).unwrap();
        assert_eq!(conflicts[0].fields, vec!["stock".to_string()]);
    }

    #[test]
    fn test_redelivered_change_is_ignored_without_audit() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let update = change(&id, item(10, 120), 2, ChangeKind::Update);

        assert_eq!(fx.store.apply_remote(&update).unwrap(), ApplyOutcome::Applied);
        let count = fx.audit.count().unwrap();
        assert_eq!(fx.store.apply_remote(&update).unwrap(), ApplyOutcome::Ignored);
        assert_eq!(fx.audit.count().unwrap(), count);
    }

    #[test]
    fn test_echo_of_own_push_is_ignored() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let count = fx.audit.count().unwrap();

        let echo = change(&id, item(10, 100), 1, ChangeKind::Insert);
        assert_eq!(fx.store.apply_remote(&echo).unwrap(), ApplyOutcome::Ignored);
        assert_eq!(fx.audit.count().unwrap(), count);
    }

    #[test]
    fn test_live_echo_before_ack_converges() {
        let fx = fixture();
        let id = RecordId::generate();
        fx.store
            .put_local(id.clone(), item(3, 100), &cashier(ConnectivityMode::Online))
            .unwrap();
        let entry = fx.log.pending(EntityType::Inventory).unwrap().remove(0);

        let echo = change(&id, item(3, 100), 1, ChangeKind::Insert);
        assert_eq!(fx.store.apply_remote(&echo).unwrap(), ApplyOutcome::Converged);

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        // The entry left the queue with the convergence; the late ack is a no-op.
        assert_eq!(fx.store.acknowledge(&entry, 1, now()).unwrap(), None);
    }

    #[test]
    fn test_echo_of_earlier_queued_write_acknowledges_it() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let write = cashier(ConnectivityMode::Online);
        fx.store.put_local(id.clone(), item(8, 100), &write).unwrap();
        fx.store.put_local(id.clone(), item(7, 100), &write).unwrap();
        let count = fx.audit.count().unwrap();

        // Our push of 8 comes back over the live feed before its ack.
        let mut echo = change(&id, item(8, 100), 2, ChangeKind::Update);
        echo.actor = Actor::new("u-7", "cashier");
        assert_eq!(fx.store.apply_remote(&echo).unwrap(), ApplyOutcome::Converged);

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.payload, item(7, 100));
        assert_eq!(record.base.as_ref().unwrap().revision, 2);
        assert_eq!(fx.audit.count().unwrap(), count);

        let pending = fx.log.pending(EntityType::Inventory).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].decode_payload().unwrap(), item(7, 100));

        assert_eq!(
            fx.store.acknowledge(&pending[0], 3, now()).unwrap(),
            Some(SyncState::Synced)
        );
        assert!(fx.store.conflicts(EntityType::Inventory).unwrap().is_empty());
    }

    #[test]
    fn test_same_record_id_in_two_accounts() {
        let fx = fixture();
        let other = RecordStore::new(fx.db.clone(), AccountId::new("shop-2").unwrap());
        let id = RecordId::new("item-1").unwrap();
        let write = cashier(ConnectivityMode::Offline);

        fx.store.put_local(id.clone(), item(10, 100), &write).unwrap();
        other.put_local(id.clone(), item(3, 50), &write).unwrap();

        let mine = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        let theirs = other.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(mine.payload, item(10, 100));
        assert_eq!(theirs.payload, item(3, 50));
        assert_eq!(fx.store.list(EntityType::Inventory, false).unwrap().len(), 1);
    }

    #[test]
    fn test_remote_delete_tombstones() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let outcome = fx
            .store
            .apply_remote(&change(&id, item(10, 100), 2, ChangeKind::Delete))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert!(record.deleted);
        assert!(fx.store.list(EntityType::Inventory, false).unwrap().is_empty());
        assert_eq!(fx.store.list(EntityType::Inventory, true).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_record_remote_delete_is_ignored() {
        let fx = fixture();
        let id = RecordId::generate();
        let outcome = fx
            .store
            .apply_remote(&change(&id, item(1, 1), 3, ChangeKind::Delete))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert!(fx.store.get(EntityType::Inventory, &id).unwrap().is_none());
    }

    #[test]
    fn test_local_write_to_tombstone_is_not_found() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let write = cashier(ConnectivityMode::Online);
        fx.store.delete_local(EntityType::Inventory, &id, &write).unwrap();

        assert!(matches!(
            fx.store.put_local(id.clone(), item(1, 100), &write),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            fx.store.delete_local(EntityType::Inventory, &id, &write),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_local_write_keeps_conflict_state() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let write = cashier(ConnectivityMode::Online);
        fx.store.put_local(id.clone(), item(8, 100), &write).unwrap();
        fx.store
            .apply_remote(&change(&id, item(5, 100), 2, ChangeKind::Update))
            .unwrap();

        let record = fx.store.put_local(id.clone(), item(7, 100), &write).unwrap();
        assert_eq!(record.sync_state, SyncState::Conflict);
    }

    #[test]
    fn test_resolve_keep_local_requeues() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let write = cashier(ConnectivityMode::Online);
        fx.store.put_local(id.clone(), item(8, 100), &write).unwrap();
        fx.store
            .apply_remote(&change(&id, item(5, 100), 2, ChangeKind::Update))
            .unwrap();

        let record = fx
            .store
            .resolve_conflict(EntityType::Inventory, &id, ConflictChoice::KeepLocal, &write)
            .unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.payload, item(8, 100));
        assert_eq!(record.base.as_ref().unwrap().revision, 2);

        let pending = fx.log.pending(EntityType::Inventory).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].decode_payload().unwrap(), item(8, 100));
    }

    #[test]
    fn test_resolve_take_remote_discards_local_edits() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let write = cashier(ConnectivityMode::Online);
        fx.store.put_local(id.clone(), item(8, 100), &write).unwrap();
        fx.store
            .apply_remote(&change(&id, item(5, 100), 2, ChangeKind::Update))
            .unwrap();

        let record = fx
            .store
            .resolve_conflict(EntityType::Inventory, &id, ConflictChoice::TakeRemote, &write)
            .unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.payload, item(5, 100));
        assert_eq!(fx.log.pending_count().unwrap(), 0);

        assert!(matches!(
            fx.store
                .resolve_conflict(EntityType::Inventory, &id, ConflictChoice::TakeRemote, &write),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_newer_remote_replaces_retained_conflict_version() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        fx.store
            .put_local(id.clone(), item(8, 100), &cashier(ConnectivityMode::Online))
            .unwrap();
        fx.store
            .apply_remote(&change(&id, item(5, 100), 2, ChangeKind::Update))
            .unwrap();

        assert_eq!(
            fx.store
                .apply_remote(&change(&id, item(4, 100), 3, ChangeKind::Update))
                .unwrap(),
            ApplyOutcome::Conflicted
        );
        assert_eq!(
            fx.store
                .apply_remote(&change(&id, item(5, 100), 2, ChangeKind::Update))
                .unwrap(),
            ApplyOutcome::Ignored
        );
        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.remote.unwrap().payload, item(4, 100));
    }

    #[test]
    fn test_count_by_state() {
        let fx = fixture();
        synced(&fx, 1, 1);
        fx.store
            .put_local(RecordId::generate(), item(2, 2), &cashier(ConnectivityMode::Offline))
            .unwrap();
        assert_eq!(fx.store.count_by_state(SyncState::Synced).unwrap(), 1);
        assert_eq!(fx.store.count_by_state(SyncState::Pending).unwrap(), 1);
        assert_eq!(fx.store.count_by_state(SyncState::Conflict).unwrap(), 0);
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.db");
        let account = AccountId::new("shop-1").unwrap();
        let id = RecordId::generate();

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let store = RecordStore::new(db, account.clone());
            store
                .put_local(id.clone(), item(4, 50), &cashier(ConnectivityMode::Offline))
                .unwrap();
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let store = RecordStore::new(db.clone(), account.clone());
        let record = store.get(EntityType::Inventory, &id).unwrap().unwrap();
        assert_eq!(record.payload, item(4, 50));
        assert_eq!(MutationLog::new(db, account).pending_count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_remote_and_local_writes_stay_consistent() {
        let fx = fixture();
        let id = synced(&fx, 10, 100);
        let store = fx.store.clone();

        std::thread::scope(|s| {
            let remote_id = id.clone();
            let remote_store = store.clone();
            s.spawn(move || {
                for rev in 2..20u64 {
                    remote_store
                        .apply_remote(&change(&remote_id, item(10, 100 + rev as i64), rev, ChangeKind::Update))
                        .unwrap();
                }
            });
            let local_id = id.clone();
            s.spawn(move || {
                for stock in 0..18 {
                    let _ = store.put_local(local_id.clone(), item(stock, 100), &cashier(ConnectivityMode::Online));
                }
            });
        });

        let record = fx.store.get(EntityType::Inventory, &id).unwrap().unwrap();
        if record.sync_state == SyncState::Synced {
            assert!(record.base.as_ref().unwrap().same_content(&record.current_version()));
        }
        assert_eq!(fx.db.locks().len(), 0);
    }
}
