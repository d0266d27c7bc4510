//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerkeep_common::{EntityType, Record, RecordId, RecordVersion, SyncState};

/// Outcome of reconciling a local version against an incoming remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Overwrite local with remote.
    RemoteWins,
    /// Keep local; the remote version is stale or identical.
    LocalWins,
    /// Both sides changed since the base; surface to the user.
    Manual,
}

/// User decision for a record in conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep the local version and push it over the remote one.
    KeepLocal,
    /// Adopt the remote version and drop unsynced local edits.
    TakeRemote,
}

/// Information about a record in conflict.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub entity_type: EntityType,
    pub record_id: RecordId,
    pub local: RecordVersion,
    pub remote: RecordVersion,
    pub base: Option<RecordVersion>,
    /// Fields whose local and remote values differ.
    pub fields: Vec<String>,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
}

impl ConflictInfo {
    /// Build conflict info from a record; `None` if it is not in conflict.
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.sync_state != SyncState::Conflict {
            return None;
        }
        let remote = record.remote.clone()?;
        let local = record.current_version();
        let mut fields = local.payload.changed_fields(&remote.payload);
        if local.deleted != remote.deleted {
            fields.push("deleted".to_string());
        }

        Some(Self {
            entity_type: record.entity_type(),
            record_id: record.id.clone(),
            local_modified: local.updated_at,
            remote_modified: remote.updated_at,
            local,
            remote,
            base: record.base.clone(),
            fields,
        })
    }
}

/// Three-way comparison of base, local and remote versions.
///
/// A pure function of its inputs: identical inputs always yield the same
/// resolution, whichever path delivered the remote version.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve(
        base: Option<&RecordVersion>,
        local: &RecordVersion,
        remote: &RecordVersion,
    ) -> Resolution {
        if local.same_content(remote) {
            return Resolution::LocalWins;
        }

        match base {
            Some(base) => {
                if !remote.is_newer_than(base) {
                    // Re-delivery or reordering of something already seen.
                    Resolution::LocalWins
                } else if local.same_content(base) {
                    Resolution::RemoteWins
                } else {
                    Resolution::Manual
                }
            }
            None => Resolution::Manual,
        }
    }
}
