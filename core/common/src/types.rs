//! Common types used throughout ledgerkeep.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Identifier of the account that owns a set of records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create a new AccountId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("AccountId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a business record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("RecordId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The record types that share the reconciliation machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Inventory,
    Transaction,
    Receivable,
    LedgerEntry,
    Contact,
}

impl EntityType {
    /// Every entity type, in the order sync cycles visit them.
    pub const ALL: [EntityType; 5] = [
        EntityType::Contact,
        EntityType::Inventory,
        EntityType::Transaction,
        EntityType::Receivable,
        EntityType::LedgerEntry,
    ];

    /// Table name, both locally and on the remote authority.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Inventory => "inventory_items",
            EntityType::Transaction => "transactions",
            EntityType::Receivable => "receivables",
            EntityType::LedgerEntry => "ledger_entries",
            EntityType::Contact => "contacts",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inventory" | "inventory_items" => Ok(EntityType::Inventory),
            "transaction" | "transactions" => Ok(EntityType::Transaction),
            "receivable" | "receivables" => Ok(EntityType::Receivable),
            "ledger_entry" | "ledger_entries" => Ok(EntityType::LedgerEntry),
            "contact" | "contacts" => Ok(EntityType::Contact),
            other => Err(Error::InvalidInput(format!("Unknown entity type: {}", other))),
        }
    }
}

/// Synchronization state of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local content is identical to the last-known remote content.
    Synced,
    /// A local write has not been acknowledged by the remote authority.
    Pending,
    /// A remote write diverged from an unacknowledged local write.
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(SyncState::Synced),
            "pending" => Ok(SyncState::Pending),
            "conflict" => Ok(SyncState::Conflict),
            other => Err(Error::InvalidInput(format!("Unknown sync state: {}", other))),
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}

/// Connectivity at the time an action was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMode {
    Online,
    Offline,
}

impl ConnectivityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityMode::Online => "online",
            ConnectivityMode::Offline => "offline",
        }
    }
}

impl FromStr for ConnectivityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(ConnectivityMode::Online),
            "offline" => Ok(ConnectivityMode::Offline),
            other => Err(Error::InvalidInput(format!("Unknown mode: {}", other))),
        }
    }
}

/// Identity performing an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User id.
    pub id: String,
    /// Role at the time of the action (e.g. "owner", "cashier").
    pub role: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }

    /// Placeholder actor for remote changes that carry no identity.
    pub fn unknown_remote() -> Self {
        Self::new("remote", "unknown")
    }
}

/// Current time truncated to millisecond precision.
///
/// Timestamps are persisted as epoch milliseconds, so values created in
/// memory must not carry more precision than survives a round trip.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_empty_fails() {
        assert!(AccountId::new("").is_err());
        assert!(AccountId::new("   ").is_err());
        assert_eq!(AccountId::new("acct-1").unwrap().as_str(), "acct-1");
    }

    #[test]
    fn test_record_id_generate_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!("inventory".parse::<EntityType>().unwrap(), EntityType::Inventory);
        assert_eq!("ledger_entries".parse::<EntityType>().unwrap(), EntityType::LedgerEntry);
        assert!("widgets".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_tables_unique() {
        let mut tables: Vec<&str> = EntityType::ALL.iter().map(|t| t.table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), EntityType::ALL.len());
    }

    #[test]
    fn test_sync_state_round_trip_str() {
        for state in [SyncState::Synced, SyncState::Pending, SyncState::Conflict] {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
    }

    #[test]
    fn test_now_has_millisecond_precision() {
        let t = now();
        assert_eq!(t.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
