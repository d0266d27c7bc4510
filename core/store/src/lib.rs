//! Durable local storage for ledgerkeep.
//!
//! All state lives in one SQLite database opened through [`Database`]:
//! - one table per entity type holding the canonical record copies
//! - the mutation log of local writes awaiting upload
//! - the append-only audit trail
//! - pull cursors and sync bookkeeping

pub mod audit;
pub mod conflict;
pub mod cursor;
pub mod db;
pub mod locks;
pub mod mutation;
pub mod record;

pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditQuery, AuditTrail, NewAuditEntry};
pub use conflict::{ConflictChoice, ConflictInfo, ConflictResolver, Resolution};
pub use cursor::CursorStore;
pub use db::Database;
pub use mutation::{MutationEntry, MutationLog, MutationOp, NewMutation};
pub use record::{ApplyOutcome, LocalWrite, RecordStore};
