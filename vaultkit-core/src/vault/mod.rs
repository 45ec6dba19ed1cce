//! The on-disk vault engine.
//!
//! A vault is one file: a 104-byte header (password salt, sealed master
//! key, last server time), a slot count, a fixed-capacity slot table, a
//! heap of encrypted records, and a trailing keyed MAC over everything
//! before it.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Header (104 bytes)            │  offset 0
//! ├──────────────────────────────────────────┤
//! │           slot count N (4 bytes)         │  offset 104
//! ├──────────────────────────────────────────┤
//! │          Slot table (16·N bytes)         │  offset 108
//! ├──────────────────────────────────────────┤
//! │                                          │
//! │        Record heap (append order)        │
//! │                                          │
//! ├──────────────────────────────────────────┤
//! │            file MAC (32 bytes)           │  EOF-32
//! └──────────────────────────────────────────┘
//! ```
//!
//! Mutations append records into the first unused slot; deletes tombstone
//! the slot and wipe the value bytes in place; compaction repacks live
//! records and doubles the table when it fills. Every mutation ends by
//! restamping the file MAC, so the trailing 32 bytes always authenticate
//! the whole file. Crash-atomicity is not promised: a torn mutation
//! surfaces as a MAC failure on the next open, and recovery is re-download
//! from the sync server.

pub mod compact;
pub mod file;
pub mod format;
pub mod header;
pub mod index;
pub mod records;
pub mod recovery;
pub mod session;
pub mod slots;

pub use header::VaultHeader;
pub use index::{KeyEntry, KeyIndex};
pub use recovery::{
    make_server_password, response_tokens, RecoveryBundle, RecoveryReset, ResponseTokens,
    RECOVERY_BLOB_SIZE,
};
pub use session::Session;
pub use slots::Slot;
