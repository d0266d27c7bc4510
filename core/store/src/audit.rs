//! Append-only audit trail.
//!
//! Entries can only be appended; the schema rejects updates and deletes with
//! triggers. Queries are lazy and page through matching entries in insertion
//! order, so large histories are never loaded at once.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, Row};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use ledgerkeep_common::{AccountId, Actor, ConnectivityMode, EntityType, Error, RecordId, Result};

use crate::db::{from_millis, storage_error, to_millis, Database};

const PAGE_SIZE: usize = 100;

/// Kind of audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Login,
    Logout,
    RoleChange,
    Payment,
    /// Sync diagnostics such as rejected remote payloads.
    Sync,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::RoleChange => "role_change",
            AuditAction::Payment => "payment",
            AuditAction::Sync => "sync",
        }
    }
}

impl FromStr for AuditAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(AuditAction::Create),
            "update" => Ok(AuditAction::Update),
            "delete" => Ok(AuditAction::Delete),
            "login" => Ok(AuditAction::Login),
            "logout" => Ok(AuditAction::Logout),
            "role_change" => Ok(AuditAction::RoleChange),
            "payment" => Ok(AuditAction::Payment),
            "sync" => Ok(AuditAction::Sync),
            other => Err(Error::InvalidInput(format!("Unknown audit action: {}", other))),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored audit entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub seq: i64,
    pub id: String,
    pub account_id: AccountId,
    pub actor: Actor,
    pub action: AuditAction,
    pub entity_type: Option<EntityType>,
    pub record_id: Option<RecordId>,
    pub description: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub mode: ConnectivityMode,
    pub created_at: DateTime<Utc>,
}

/// An audit entry to append.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: Actor,
    pub action: AuditAction,
    pub entity_type: Option<EntityType>,
    pub record_id: Option<RecordId>,
    pub description: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub mode: ConnectivityMode,
}

impl NewAuditEntry {
    pub fn new(
        actor: Actor,
        action: AuditAction,
        mode: ConnectivityMode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            actor,
            action,
            entity_type: None,
            record_id: None,
            description: description.into(),
            before: None,
            after: None,
            mode,
        }
    }

    pub fn with_record(mut self, entity_type: EntityType, record_id: RecordId) -> Self {
        self.entity_type = Some(entity_type);
        self.record_id = Some(record_id);
        self
    }

    pub fn with_snapshots(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

/// Filter for audit queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub entity_type: Option<EntityType>,
    pub record_id: Option<RecordId>,
    /// Case-insensitive substring of the description.
    pub description_contains: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn record(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn description(mut self, needle: impl Into<String>) -> Self {
        self.description_contains = Some(needle.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

/// Per-account view of the audit trail.
#[derive(Clone)]
pub struct AuditTrail {
    db: Arc<Database>,
    account: AccountId,
}

impl AuditTrail {
    pub fn new(db: Arc<Database>, account: AccountId) -> Self {
        Self { db, account }
    }

    /// Append an entry outside any record write (session events, sync
    /// diagnostics).
    pub fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        self.db
            .transaction(|conn| insert(conn, &self.account, &entry))
    }

    /// Lazily iterate entries matching `filter`, oldest first.
    pub fn query(&self, filter: AuditFilter) -> AuditQuery {
        AuditQuery {
            db: self.db.clone(),
            account: self.account.clone(),
            filter,
            after_seq: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn count(&self) -> Result<u64> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM audit_trail WHERE account_id = ?1",
                params![self.account.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(storage_error)
        })
    }
}

/// Lazy, finite iterator over matching audit entries.
pub struct AuditQuery {
    db: Arc<Database>,
    account: AccountId,
    filter: AuditFilter,
    after_seq: i64,
    buffer: VecDeque<AuditEntry>,
    exhausted: bool,
}

impl AuditQuery {
    fn fetch_page(&mut self) -> Result<()> {
        let mut sql = String::from(
            "SELECT seq, id, account_id, actor_id, actor_role, action, entity_type, record_id,
                    description, before_snapshot, after_snapshot, mode, created_at
             FROM audit_trail WHERE account_id = ? AND seq > ?",
        );
        let mut args: Vec<SqlValue> = vec![
            SqlValue::Text(self.account.as_str().to_string()),
            SqlValue::Integer(self.after_seq),
        ];

        if let Some(actor) = &self.filter.actor_id {
            sql.push_str(" AND actor_id = ?");
            args.push(SqlValue::Text(actor.clone()));
        }
        if let Some(action) = self.filter.action {
            sql.push_str(" AND action = ?");
            args.push(SqlValue::Text(action.as_str().to_string()));
        }
        if let Some(entity_type) = self.filter.entity_type {
            sql.push_str(" AND entity_type = ?");
            args.push(SqlValue::Text(entity_type.table().to_string()));
        }
        if let Some(record_id) = &self.filter.record_id {
            sql.push_str(" AND record_id = ?");
            args.push(SqlValue::Text(record_id.as_str().to_string()));
        }
        if let Some(needle) = &self.filter.description_contains {
            sql.push_str(" AND description LIKE ? ESCAPE '\\'");
            args.push(SqlValue::Text(format!("%{}%", escape_like(needle))));
        }
        if let Some(since) = self.filter.since {
            sql.push_str(" AND created_at >= ?");
            args.push(SqlValue::Integer(to_millis(since)));
        }
        sql.push_str(&format!(" ORDER BY seq ASC LIMIT {}", PAGE_SIZE));

        let raw = self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(storage_error)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), RawAudit::from_row)
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            Ok(rows)
        })?;

        if raw.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        for row in raw {
            self.after_seq = row.seq;
            self.buffer.push_back(row.decode()?);
        }
        Ok(())
    }
}

impl Iterator for AuditQuery {
    type Item = Result<AuditEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

struct RawAudit {
    seq: i64,
    id: String,
    account_id: String,
    actor_id: String,
    actor_role: String,
    action: String,
    entity_type: Option<String>,
    record_id: Option<String>,
    description: String,
    before: Option<String>,
    after: Option<String>,
    mode: String,
    created_at: i64,
}

impl RawAudit {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            account_id: row.get(2)?,
            actor_id: row.get(3)?,
            actor_role: row.get(4)?,
            action: row.get(5)?,
            entity_type: row.get(6)?,
            record_id: row.get(7)?,
            description: row.get(8)?,
            before: row.get(9)?,
            after: row.get(10)?,
            mode: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<AuditEntry> {
        Ok(AuditEntry {
            seq: self.seq,
            id: self.id,
            account_id: AccountId::new(self.account_id)?,
            actor: Actor::new(self.actor_id, self.actor_role),
            action: self.action.parse()?,
            entity_type: self.entity_type.map(|t| t.parse()).transpose()?,
            record_id: self.record_id.map(RecordId::new).transpose()?,
            description: self.description,
            before: self.before.map(|s| serde_json::from_str(&s)).transpose()?,
            after: self.after.map(|s| serde_json::from_str(&s)).transpose()?,
            mode: self.mode.parse()?,
            created_at: from_millis(self.created_at),
        })
    }
}

pub(crate) fn insert(
    conn: &Connection,
    account: &AccountId,
    entry: &NewAuditEntry,
) -> Result<AuditEntry> {
    let id = Uuid::new_v4().to_string();
    let created_at = ledgerkeep_common::now();
    let before = entry.before.as_ref().map(serde_json::to_string).transpose()?;
    let after = entry.after.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO audit_trail (id, account_id, actor_id, actor_role, action, entity_type,
                                  record_id, description, before_snapshot, after_snapshot,
                                  mode, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            account.as_str(),
            entry.actor.id,
            entry.actor.role,
            entry.action.as_str(),
            entry.entity_type.map(|t| t.table()),
            entry.record_id.as_ref().map(|r| r.as_str()),
            entry.description,
            before,
            after,
            entry.mode.as_str(),
            to_millis(created_at),
        ],
    )
    .map_err(storage_error)?;

    Ok(AuditEntry {
        seq: conn.last_insert_rowid(),
        id,
        account_id: account.clone(),
        actor: entry.actor.clone(),
        action: entry.action,
        entity_type: entry.entity_type,
        record_id: entry.record_id.clone(),
        description: entry.description.clone(),
        before: entry.before.clone(),
        after: entry.after.clone(),
        mode: entry.mode,
        created_at,
    })
}
