//! Common utilities and types shared across ledgerkeep modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy, identifiers, the closed set of entity payloads and the
//! record/version model the reconciliation machinery works on.

pub mod entity;
pub mod error;
pub mod record;
pub mod types;

pub use entity::{
    Contact, ContactKind, EntityPayload, InventoryItem, LedgerEntry, Receivable,
    ReceivableStatus, Transaction, TransactionKind,
};
pub use error::{Error, Result};
pub use record::{ChangeKind, IncomingChange, Record, RecordVersion};
pub use types::{
    now, AccountId, Actor, ConnectivityMode, EntityType, Origin, RecordId, SyncState,
};
