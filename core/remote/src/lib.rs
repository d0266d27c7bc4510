//! Remote authority abstraction for ledgerkeep.
//!
//! The remote authority is the shared source of truth every device of an
//! account synchronizes with. This crate defines the trait the sync machinery
//! talks to, the wire types it exchanges, and an in-process implementation.

pub mod authority;
pub mod memory;

pub use authority::{
    ChangeBatch, RemoteAck, RemoteAuthority, RemoteChange, RemoteRow, RemoteSubscription,
    RemoteWrite,
};
pub use memory::MemoryRemote;
