//! Application-facing API of ledgerkeep.
//!
//! [`Ledger`] is the local, always-available surface the UI works against.
//! [`LedgerSync`] attaches it to a remote authority.

pub mod config;
pub mod ledger;
pub mod sync;

pub use config::{default_database_path, LedgerConfig};
pub use ledger::Ledger;
pub use sync::LedgerSync;
