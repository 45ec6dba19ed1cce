//! `vaultkit-core` — a single-file encrypted key-value vault engine.
//!
//! The engine backs a password-manager-style application and its sync
//! server. Each vault is one file holding a small header, a fixed-capacity
//! slot table, and a heap of records whose values are sealed with
//! XChaCha20-Poly1305 under a random master key; the master key is itself
//! sealed under an Argon2id password-derived key, and the whole file
//! carries a trailing keyed BLAKE2b MAC. Records can round-trip through
//! the server as opaque blobs — the server stores what it cannot read.
//!
//! The entry point is [`vault::Session`]: one session, at most one open
//! vault, secrets in guarded memory that is inaccessible between calls.
//!
//! ```no_run
//! use vaultkit_core::vault::Session;
//!
//! # fn main() -> Result<(), vaultkit_core::VaultError> {
//! let mut session = Session::new()?;
//! session.create("/tmp", "alice", "hunter2")?;
//! session.add(1, "email", b"a@b.com", 1000)?;
//! session.open_key("email")?;
//! let (entry_type, value) = session.read_value()?;
//! assert_eq!(entry_type, 1);
//! assert_eq!(&value[..], b"a@b.com");
//! session.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod error;
pub mod secure;
pub mod vault;

pub use error::{ErrorCode, VaultError, VaultResult};
pub use vault::Session;
