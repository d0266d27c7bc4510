//! Pull cursors and sync bookkeeping.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use ledgerkeep_common::{AccountId, EntityType, Result};

use crate::db::{from_millis, storage_error, to_millis, Database};

const LAST_SYNCED_AT: &str = "last_synced_at";

/// Per (account, entity type) high-water mark of pulled remote changes.
///
/// A missing cursor reads as `0`, meaning "from the beginning".
#[derive(Clone)]
pub struct CursorStore {
    db: Arc<Database>,
    account: AccountId,
}

impl CursorStore {
    pub fn new(db: Arc<Database>, account: AccountId) -> Self {
        Self { db, account }
    }

    pub fn get(&self, entity_type: EntityType) -> Result<u64> {
        let cursor: Option<i64> = self.db.read(|conn| {
            conn.query_row(
                "SELECT cursor FROM sync_cursors WHERE account_id = ?1 AND entity_type = ?2",
                params![self.account.as_str(), entity_type.table()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)
        })?;
        Ok(cursor.unwrap_or(0) as u64)
    }

    /// Move the cursor forward. Never moves backwards.
    ///
    /// Returns the stored cursor.
    pub fn advance(&self, entity_type: EntityType, cursor: u64) -> Result<u64> {
        self.db.transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_cursors (account_id, entity_type, cursor, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, entity_type) DO UPDATE SET
                     cursor = MAX(cursor, excluded.cursor),
                     updated_at = excluded.updated_at",
                params![
                    self.account.as_str(),
                    entity_type.table(),
                    cursor as i64,
                    to_millis(ledgerkeep_common::now()),
                ],
            )
            .map_err(storage_error)?;

            conn.query_row(
                "SELECT cursor FROM sync_cursors WHERE account_id = ?1 AND entity_type = ?2",
                params![self.account.as_str(), entity_type.table()],
                |row| row.get::<_, i64>(0),
            )
            .map(|c| c as u64)
            .map_err(storage_error)
        })
    }

    /// Completion time of the last successful sync cycle.
    pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .db
            .get_meta(&self.account, LAST_SYNCED_AT)?
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_millis))
    }

    pub fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.db
            .set_meta(&self.account, LAST_SYNCED_AT, &to_millis(at).to_string())
    }
}
