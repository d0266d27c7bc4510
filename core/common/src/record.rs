//! Records, record versions and decoded remote changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityPayload;
use crate::types::{AccountId, Actor, EntityType, RecordId, SyncState};
use crate::Result;

/// One observed version of a record's content.
///
/// `revision` is the per-record counter assigned by the remote authority.
/// Versions that were never acknowledged carry the revision they were
/// edited against; `0` means unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVersion {
    pub payload: EntityPayload,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredVersion {
    payload: serde_json::Value,
    deleted: bool,
    updated_at: DateTime<Utc>,
    revision: u64,
}

impl RecordVersion {
    /// Content equality: domain fields and tombstone flag.
    ///
    /// Timestamps and revisions are bookkeeping, not content.
    pub fn same_content(&self, other: &RecordVersion) -> bool {
        self.deleted == other.deleted && self.payload == other.payload
    }

    /// Whether this version was written after `base`.
    ///
    /// Uses revisions when both sides know theirs, wall-clock time otherwise.
    pub fn is_newer_than(&self, base: &RecordVersion) -> bool {
        if self.revision > 0 && base.revision > 0 {
            self.revision > base.revision
        } else {
            self.updated_at > base.updated_at
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let stored = StoredVersion {
            payload: self.payload.to_value()?,
            deleted: self.deleted,
            updated_at: self.updated_at,
            revision: self.revision,
        };
        Ok(serde_json::to_string(&stored)?)
    }

    pub fn from_json(entity_type: EntityType, record_id: &str, json: &str) -> Result<Self> {
        let stored: StoredVersion = serde_json::from_str(json)?;
        Ok(Self {
            payload: EntityPayload::decode(entity_type, record_id, stored.payload)?,
            deleted: stored.deleted,
            updated_at: stored.updated_at,
            revision: stored.revision,
        })
    }
}

/// The canonical local copy of a business record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub account_id: AccountId,
    pub payload: EntityPayload,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Revision the current content was last reconciled against.
    pub revision: u64,
    pub sync_state: SyncState,
    /// Conflict base: last version known identical on both sides.
    pub base: Option<RecordVersion>,
    /// Remote version retained while the record is in conflict.
    pub remote: Option<RecordVersion>,
}

impl Record {
    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    /// The version readers currently observe.
    pub fn current_version(&self) -> RecordVersion {
        RecordVersion {
            payload: self.payload.clone(),
            deleted: self.deleted,
            updated_at: self.updated_at,
            revision: self.revision,
        }
    }
}

/// Kind of change reported by the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A remote change decoded at the boundary into typed content.
#[derive(Debug, Clone)]
pub struct IncomingChange {
    pub record_id: RecordId,
    pub version: RecordVersion,
    pub created_at: DateTime<Utc>,
    pub kind: ChangeKind,
    /// Identity the remote authority asserts made the change.
    pub actor: Actor,
    /// Remote sequence number; 0 for live events without one.
    pub seq: u64,
}

impl IncomingChange {
    pub fn entity_type(&self) -> EntityType {
        self.version.payload.entity_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Contact, ContactKind};
    use chrono::Duration;

    fn version(name: &str, revision: u64) -> RecordVersion {
        RecordVersion {
            payload: EntityPayload::Contact(Contact {
                name: name.into(),
                kind: ContactKind::Customer,
                phone: None,
                email: None,
            }),
            deleted: false,
            updated_at: crate::types::now(),
            revision,
        }
    }

    #[test]
    fn test_same_content_ignores_bookkeeping() {
        let a = version("Ada", 1);
        let mut b = version("Ada", 7);
        b.updated_at = a.updated_at + Duration::hours(1);
        assert!(a.same_content(&b));

        b.deleted = true;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_newer_by_revision() {
        let base = version("Ada", 3);
        let mut remote = version("Bob", 4);
        // Skewed clock on the remote device does not matter when revisions are known.
        remote.updated_at = base.updated_at - Duration::days(1);
        assert!(remote.is_newer_than(&base));
        assert!(!base.is_newer_than(&remote));
    }

    #[test]
    fn test_newer_falls_back_to_timestamp() {
        let base = version("Ada", 0);
        let mut remote = version("Bob", 5);
        remote.updated_at = base.updated_at + Duration::seconds(1);
        assert!(remote.is_newer_than(&base));
    }

    #[test]
    fn test_version_json_round_trip() {
        let v = version("Ada", 2);
        let json = v.to_json().unwrap();
        let back = RecordVersion::from_json(EntityType::Contact, "c-1", &json).unwrap();
        assert_eq!(v, back);
    }
}
