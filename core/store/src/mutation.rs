//! Durable queue of local writes awaiting upload.
//!
//! Every local write appends one entry in the same transaction as the record
//! change itself. Entries are never removed when pushed; they are marked
//! synced (or discarded when the remote version is adopted instead) and only
//! dropped later by an explicit prune.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use ledgerkeep_common::{AccountId, EntityPayload, EntityType, Error, RecordId, Result};

use crate::db::{from_millis, storage_error, to_millis, Database};

/// Kind of local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }
}

impl FromStr for MutationOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(MutationOp::Create),
            "update" => Ok(MutationOp::Update),
            "delete" => Ok(MutationOp::Delete),
            other => Err(Error::Storage(format!("Unknown mutation op: {}", other))),
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued local write.
#[derive(Debug, Clone)]
pub struct MutationEntry {
    /// Local sequence; defines upload order.
    pub seq: i64,
    pub id: String,
    pub account_id: AccountId,
    pub entity_type: EntityType,
    pub record_id: RecordId,
    pub op: MutationOp,
    /// Canonical JSON of the payload as written.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

impl MutationEntry {
    pub fn decode_payload(&self) -> Result<EntityPayload> {
        EntityPayload::from_json(self.entity_type, self.record_id.as_str(), &self.payload)
    }
}

/// A write to enqueue.
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub entity_type: EntityType,
    pub record_id: RecordId,
    pub op: MutationOp,
    pub payload: String,
}

/// How an entry left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    Discarded,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Discarded => "discarded",
        }
    }
}

/// Per-account view of the mutation log.
#[derive(Clone)]
pub struct MutationLog {
    db: Arc<Database>,
    account: AccountId,
}

impl MutationLog {
    pub fn new(db: Arc<Database>, account: AccountId) -> Self {
        Self { db, account }
    }

    /// Append an entry in its own transaction.
    ///
    /// Record writes go through the record store, which appends inside the
    /// record's transaction; this is for callers enqueueing directly.
    pub fn append(&self, mutation: NewMutation) -> Result<MutationEntry> {
        self.db
            .transaction(|conn| insert(conn, &self.account, &mutation))
    }

    /// Unsynced entries of one entity type, oldest first.
    ///
    /// Returns a snapshot; calling again restarts from the oldest entry
    /// still unsynced.
    pub fn pending(&self, entity_type: EntityType) -> Result<Vec<MutationEntry>> {
        self.db.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, id, account_id, entity_type, record_id, op, payload, created_at, synced
                     FROM mutation_log
                     WHERE account_id = ?1 AND entity_type = ?2 AND synced = 0
                     ORDER BY seq ASC",
                )
                .map_err(storage_error)?;
            let raw = stmt
                .query_map(params![self.account.as_str(), entity_type.table()], RawEntry::from_row)
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            raw.into_iter().map(RawEntry::decode).collect()
        })
    }

    /// All entries for one record, oldest first.
    pub fn entries_for_record(&self, record_id: &RecordId) -> Result<Vec<MutationEntry>> {
        self.db.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, id, account_id, entity_type, record_id, op, payload, created_at, synced
                     FROM mutation_log
                     WHERE account_id = ?1 AND record_id = ?2
                     ORDER BY seq ASC",
                )
                .map_err(storage_error)?;
            let raw = stmt
                .query_map(params![self.account.as_str(), record_id.as_str()], RawEntry::from_row)
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            raw.into_iter().map(RawEntry::decode).collect()
        })
    }

    /// Mark an entry as acknowledged by the remote authority.
    ///
    /// Returns `false` if the entry was already synced.
    pub fn mark_synced(&self, entry_id: &str) -> Result<bool> {
        self.db
            .transaction(|conn| mark(conn, entry_id, Outcome::Acked))
    }

    /// Number of unsynced entries across all entity types.
    pub fn pending_count(&self) -> Result<u64> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM mutation_log WHERE account_id = ?1 AND synced = 0",
                params![self.account.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(storage_error)
        })
    }

    /// Delete synced entries acknowledged before `older_than`.
    pub fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let removed = self.db.transaction(|conn| {
            conn.execute(
                "DELETE FROM mutation_log
                 WHERE account_id = ?1 AND synced = 1 AND synced_at < ?2",
                params![self.account.as_str(), to_millis(older_than)],
            )
            .map_err(storage_error)
        })?;
        debug!("Pruned {} synced mutation entries", removed);
        Ok(removed)
    }
}

struct RawEntry {
    seq: i64,
    id: String,
    account_id: String,
    entity_type: String,
    record_id: String,
    op: String,
    payload: String,
    created_at: i64,
    synced: bool,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            account_id: row.get(2)?,
            entity_type: row.get(3)?,
            record_id: row.get(4)?,
            op: row.get(5)?,
            payload: row.get(6)?,
            created_at: row.get(7)?,
            synced: row.get(8)?,
        })
    }

    fn decode(self) -> Result<MutationEntry> {
        Ok(MutationEntry {
            seq: self.seq,
            id: self.id,
            account_id: AccountId::new(self.account_id)?,
            entity_type: self.entity_type.parse()?,
            record_id: RecordId::new(self.record_id)?,
            op: self.op.parse()?,
            payload: self.payload,
            created_at: from_millis(self.created_at),
            synced: self.synced,
        })
    }
}

pub(crate) fn insert(
    conn: &Connection,
    account: &AccountId,
    mutation: &NewMutation,
) -> Result<MutationEntry> {
    let id = Uuid::new_v4().to_string();
    let created_at = ledgerkeep_common::now();

    conn.execute(
        "INSERT INTO mutation_log (id, account_id, entity_type, record_id, op, payload, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        params![
            id,
            account.as_str(),
            mutation.entity_type.table(),
            mutation.record_id.as_str(),
            mutation.op.as_str(),
            mutation.payload,
            to_millis(created_at),
        ],
    )
    .map_err(storage_error)?;

    Ok(MutationEntry {
        seq: conn.last_insert_rowid(),
        id,
        account_id: account.clone(),
        entity_type: mutation.entity_type,
        record_id: mutation.record_id.clone(),
        op: mutation.op,
        payload: mutation.payload.clone(),
        created_at,
        synced: false,
    })
}

pub(crate) fn mark(conn: &Connection, entry_id: &str, outcome: Outcome) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE mutation_log SET synced = 1, outcome = ?2, synced_at = ?3
             WHERE id = ?1 AND synced = 0",
            params![entry_id, outcome.as_str(), to_millis(ledgerkeep_common::now())],
        )
        .map_err(storage_error)?;
    Ok(changed > 0)
}

/// Discard every unsynced entry of a record.
pub(crate) fn discard_for_record(
    conn: &Connection,
    account: &AccountId,
    entity_type: EntityType,
    record_id: &RecordId,
) -> Result<usize> {
    conn.execute(
        "UPDATE mutation_log SET synced = 1, outcome = ?4, synced_at = ?5
         WHERE account_id = ?1 AND entity_type = ?2 AND record_id = ?3 AND synced = 0",
        params![
            account.as_str(),
            entity_type.table(),
            record_id.as_str(),
            Outcome::Discarded.as_str(),
            to_millis(ledgerkeep_common::now()),
        ],
    )
    .map_err(storage_error)
}

/// Unsynced entries of one record, oldest first.
pub(crate) fn unsynced_for_record(
    conn: &Connection,
    account: &AccountId,
    entity_type: EntityType,
    record_id: &RecordId,
) -> Result<Vec<MutationEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, id, account_id, entity_type, record_id, op, payload, created_at, synced
             FROM mutation_log
             WHERE account_id = ?1 AND entity_type = ?2 AND record_id = ?3 AND synced = 0
             ORDER BY seq ASC",
        )
        .map_err(storage_error)?;
    let raw = stmt
        .query_map(
            params![account.as_str(), entity_type.table(), record_id.as_str()],
            RawEntry::from_row,
        )
        .map_err(storage_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_error)?;
    raw.into_iter().map(RawEntry::decode).collect()
}

/// Whether a record still has unsynced entries.
pub(crate) fn has_unsynced(
    conn: &Connection,
    account: &AccountId,
    entity_type: EntityType,
    record_id: &RecordId,
) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM mutation_log
         WHERE account_id = ?1 AND entity_type = ?2 AND record_id = ?3 AND synced = 0
         LIMIT 1",
        params![account.as_str(), entity_type.table(), record_id.as_str()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(storage_error)
}
