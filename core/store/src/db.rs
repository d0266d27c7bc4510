//! SQLite-backed local database context.
//!
//! One `Database` is opened per process and shared (behind an `Arc`) by every
//! component that needs durable storage. It owns the connection, the schema
//! and the per-record lock table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use ledgerkeep_common::{AccountId, EntityType, Error, Result};

use crate::locks::RecordLocks;

/// Durable local database shared by the record store, mutation log,
/// audit trail and cursor store.
pub struct Database {
    conn: Mutex<Connection>,
    locks: RecordLocks,
}

impl Database {
    /// Create or open a database file, creating parent directories.
    ///
    /// # Errors
    /// - Directory creation, database open or schema initialization failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage_error)?;
        info!("Local database opened at {}", path.display());
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(storage_error)?;
        conn.execute_batch(&schema()).map_err(storage_error)?;
        debug!("Schema initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            locks: RecordLocks::default(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database connection lock poisoned".to_string()))
    }

    /// Run read-only statements against the connection.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one SQLite transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls back
    /// every statement `f` executed.
    pub(crate) fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_error)?;
        let value = f(&tx)?;
        tx.commit().map_err(storage_error)?;
        Ok(value)
    }

    pub(crate) fn locks(&self) -> &RecordLocks {
        &self.locks
    }

    /// Get a per-account bookkeeping value.
    pub fn get_meta(&self, account: &AccountId, key: &str) -> Result<Option<String>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT value FROM sync_meta WHERE account_id = ?1 AND key = ?2",
                params![account.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)
        })
    }

    /// Set a per-account bookkeeping value.
    pub fn set_meta(&self, account: &AccountId, key: &str, value: &str) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_meta (account_id, key, value) VALUES (?1, ?2, ?3)",
                params![account.as_str(), key, value],
            )
            .map_err(storage_error)?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.read(|conn| conn.execute_batch(sql).map_err(storage_error))
    }
}

fn schema() -> String {
    let mut sql = String::new();

    for entity_type in EntityType::ALL {
        let table = entity_type.table();
        sql.push_str(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                sync_state TEXT NOT NULL,
                base TEXT,
                remote TEXT,
                PRIMARY KEY (account_id, id)
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_account_state
                ON {table}(account_id, sync_state);
            "#
        ));
    }

    sql.push_str(
        r#"
        CREATE TABLE IF NOT EXISTS mutation_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            op TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            outcome TEXT,
            synced_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_mutation_pending
            ON mutation_log(account_id, synced, entity_type);
        CREATE INDEX IF NOT EXISTS idx_mutation_record
            ON mutation_log(account_id, record_id);

        CREATE TABLE IF NOT EXISTS audit_trail (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            actor_role TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_type TEXT,
            record_id TEXT,
            description TEXT NOT NULL,
            before_snapshot TEXT,
            after_snapshot TEXT,
            mode TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_account_time
            ON audit_trail(account_id, created_at);

        CREATE TRIGGER IF NOT EXISTS audit_trail_no_update
        BEFORE UPDATE ON audit_trail
        BEGIN
            SELECT RAISE(ABORT, 'audit trail is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS audit_trail_no_delete
        BEFORE DELETE ON audit_trail
        BEGIN
            SELECT RAISE(ABORT, 'audit trail is append-only');
        END;

        CREATE TABLE IF NOT EXISTS sync_cursors (
            account_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (account_id, entity_type)
        );

        CREATE TABLE IF NOT EXISTS sync_meta (
            account_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (account_id, key)
        );
        "#,
    );

    sql
}

/// Convert a SQLite failure into a local storage failure.
pub(crate) fn storage_error(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("ledger.db");
        let _db = Database::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_meta_round_trip() {
        let db = Database::in_memory().unwrap();
        let account = AccountId::new("acct").unwrap();

        assert!(db.get_meta(&account, "last_synced_at").unwrap().is_none());
        db.set_meta(&account, "last_synced_at", "123").unwrap();
        assert_eq!(db.get_meta(&account, "last_synced_at").unwrap().as_deref(), Some("123"));
    }

    #[test]
    fn test_meta_is_account_scoped() {
        let db = Database::in_memory().unwrap();
        let a = AccountId::new("a").unwrap();
        let b = AccountId::new("b").unwrap();

        db.set_meta(&a, "k", "1").unwrap();
        assert!(db.get_meta(&b, "k").unwrap().is_none());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::in_memory().unwrap();
        let account = AccountId::new("acct").unwrap();

        let result: Result<()> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_meta (account_id, key, value) VALUES (?1, 'k', 'v')",
                params![account.as_str()],
            )
            .map_err(storage_error)?;
            Err(Error::Storage("simulated".into()))
        });

        assert!(result.is_err());
        assert!(db.get_meta(&account, "k").unwrap().is_none());
    }

    #[test]
    fn test_millis_round_trip() {
        let t = ledgerkeep_common::now();
        assert_eq!(from_millis(to_millis(t)), t);
    }
}
