//! Remote authority trait and wire types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ledgerkeep_common::{
    AccountId, Actor, ChangeKind, EntityPayload, EntityType, Error, IncomingChange, RecordId,
    RecordVersion, Result,
};

/// A row as stored by the remote authority.
///
/// The payload is untyped JSON on the wire; it only becomes an
/// [`EntityPayload`] after [`RemoteChange::decode`] checked it against the
/// entity type's field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: String,
    pub account_id: String,
    pub entity_type: EntityType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Per-record counter, incremented on every accepted write.
    pub revision: u64,
    pub deleted: bool,
    /// Identity the remote asserts made the last write.
    pub actor: Option<Actor>,
}

/// One entry of the remote change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Position in the account's change feed.
    pub seq: u64,
    pub kind: ChangeKind,
    pub row: RemoteRow,
}

impl RemoteChange {
    /// Decode into a typed change.
    ///
    /// # Errors
    /// - `MalformedPayload` if the id is unusable or the payload does not
    ///   match the field set of the row's entity type
    pub fn decode(&self) -> Result<IncomingChange> {
        let entity_type = self.row.entity_type;
        let record_id = RecordId::new(self.row.id.clone()).map_err(|e| Error::MalformedPayload {
            entity_type,
            record_id: self.row.id.clone(),
            reason: e.to_string(),
        })?;
        let payload = EntityPayload::decode(entity_type, &self.row.id, self.row.payload.clone())?;

        Ok(IncomingChange {
            record_id,
            version: RecordVersion {
                payload,
                deleted: self.row.deleted || self.kind == ChangeKind::Delete,
                updated_at: self.row.updated_at,
                revision: self.row.revision,
            },
            created_at: self.row.created_at,
            kind: self.kind,
            actor: self.row.actor.clone().unwrap_or_else(Actor::unknown_remote),
            seq: self.seq,
        })
    }
}

/// A page of the change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<RemoteChange>,
    /// Cursor to request the next page with.
    pub next_cursor: u64,
    pub has_more: bool,
}

/// Acknowledgement of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub id: String,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub seq: u64,
}

/// A row-level write sent to the remote authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWrite {
    pub entity_type: EntityType,
    pub id: RecordId,
    pub payload: serde_json::Value,
    pub actor: Actor,
}

/// Live feed of changes for one (account, entity type) pair.
///
/// Dropping the subscription closes it at the remote end.
pub struct RemoteSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<RemoteChange>,
}

impl RemoteSubscription {
    pub fn new(id: u64, receiver: mpsc::UnboundedReceiver<RemoteChange>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next change; `None` once the remote closed the feed.
    pub async fn next(&mut self) -> Option<RemoteChange> {
        self.receiver.recv().await
    }
}

/// The shared source of truth devices synchronize with.
///
/// Every operation is scoped by account. Writes are idempotent by record id:
/// re-sending an already accepted write must not create a second revision.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Authority name (for logging).
    fn name(&self) -> &str;

    /// Insert a row, or update it if the id already exists.
    ///
    /// # Errors
    /// - `Transport` / `Timeout` when the authority cannot be reached
    async fn insert(&self, account: &AccountId, write: RemoteWrite) -> Result<RemoteAck>;

    /// Update a row, or insert it if the id is unknown.
    async fn update(&self, account: &AccountId, write: RemoteWrite) -> Result<RemoteAck>;

    /// Tombstone a row. `write.payload` carries the last content.
    async fn delete(&self, account: &AccountId, write: RemoteWrite) -> Result<RemoteAck>;

    /// Changes of one entity type after `cursor`, oldest first.
    ///
    /// A cursor of `0` starts from the beginning of the feed.
    async fn changes_since(
        &self,
        account: &AccountId,
        entity_type: EntityType,
        cursor: u64,
        limit: usize,
    ) -> Result<ChangeBatch>;

    /// Open a live subscription for one entity type of one account.
    async fn subscribe(
        &self,
        account: &AccountId,
        entity_type: EntityType,
    ) -> Result<RemoteSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(payload: serde_json::Value) -> RemoteRow {
        RemoteRow {
            id: "c-1".into(),
            account_id: "acct".into(),
            entity_type: EntityType::Contact,
            payload,
            created_at: ledgerkeep_common::now(),
            updated_at: ledgerkeep_common::now(),
            revision: 3,
            deleted: false,
            actor: None,
        }
    }

    #[test]
    fn test_decode_valid_change() {
        let change = RemoteChange {
            seq: 9,
            kind: ChangeKind::Update,
            row: row(json!({"name": "Ada", "kind": "customer"})),
        };
        let decoded = change.decode().unwrap();
        assert_eq!(decoded.entity_type(), EntityType::Contact);
        assert_eq!(decoded.version.revision, 3);
        assert_eq!(decoded.actor, Actor::unknown_remote());
        assert_eq!(decoded.seq, 9);
    }

    #[test]
    fn test_decode_rejects_schema_mismatch() {
        let change = RemoteChange {
            seq: 1,
            kind: ChangeKind::Insert,
            row: row(json!({"name": "Ada", "kind": "customer", "loyalty_points": 4})),
        };
        assert!(matches!(change.decode(), Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn test_decode_rejects_empty_id() {
        let mut bad = row(json!({"name": "Ada", "kind": "customer"}));
        bad.id = "  ".into();
        let change = RemoteChange {
            seq: 1,
            kind: ChangeKind::Insert,
            row: bad,
        };
        assert!(matches!(change.decode(), Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn test_delete_kind_implies_tombstone() {
        let change = RemoteChange {
            seq: 2,
            kind: ChangeKind::Delete,
            row: row(json!({"name": "Ada", "kind": "customer"})),
        };
        assert!(change.decode().unwrap().version.deleted);
    }
}
