//! Per-record framing, value encryption, and record MAC.
//!
//! Records are concatenated in the heap in append order; order carries no
//! meaning. Each record is independently authenticated by a keyed hash over
//! every byte that precedes it, keyed with the master key, so a record can
//! travel to the sync server and back as an opaque blob and still be
//! verified locally.
//!
//! # Binary Layout
//!
//! ```text
//! Offset          Size      Field
//! ------          ----      -----
//! 0               8         mtime (u64 LE)
//! 8               1         type
//! 9               key_len   key bytes
//! 9+key_len       val_len   value ciphertext
//! +val_len        16        AEAD tag
//! +16             24        nonce
//! +24             32        record MAC (keyed hash over all preceding bytes)
//! ```

use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{VaultError, VaultResult};

use super::format::{
    record_len, HASH_SIZE, MASTER_KEY_SIZE, NONCE_SIZE, RECORD_HEADER_SIZE,
};

/// Builds a complete record: seals the value, frames it, stamps the MAC.
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] if sealing the value fails.
pub fn seal_record(
    master: &[u8; MASTER_KEY_SIZE],
    mtime: u64,
    entry_type: u8,
    key: &str,
    value: &[u8],
) -> VaultResult<Vec<u8>> {
    let nonce = crypto::random_nonce();
    let sealed = crypto::seal(master, &nonce, value)?;

    let total = record_len(key.len(), value.len());
    let mut record = Vec::with_capacity(total);
    record.extend_from_slice(&mtime.to_le_bytes());
    record.push(entry_type);
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(&sealed);
    record.extend_from_slice(&nonce);

    let mac = crypto::keyed_hash(master, &record);
    record.extend_from_slice(&mac);
    debug_assert_eq!(record.len(), total);
    Ok(record)
}

/// Verifies a record's trailing MAC under the master key.
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] if the record is too short to carry a MAC
/// or the MAC does not verify. Import paths that treat a bad blob as file
/// corruption remap this to [`VaultError::FileIntegrity`].
pub fn verify_record(master: &[u8; MASTER_KEY_SIZE], record: &[u8]) -> VaultResult<()> {
    if record.len() < record_len(0, 0) {
        return Err(VaultError::crypto("record truncated"));
    }
    let (body, stored) = record.split_at(record.len() - HASH_SIZE);
    let computed = crypto::keyed_hash(master, body);
    if !crypto::ct_eq(&computed, stored) {
        return Err(VaultError::crypto("record MAC mismatch"));
    }
    Ok(())
}

/// Verifies a record and decrypts its value.
///
/// `key_len` and `val_len` come from the record's slot; the record byte
/// length must match them exactly.
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] if the framing is inconsistent, the MAC
/// does not verify, or the value fails to decrypt.
pub fn open_record(
    master: &[u8; MASTER_KEY_SIZE],
    record: &[u8],
    key_len: usize,
    val_len: usize,
) -> VaultResult<(u64, u8, Zeroizing<Vec<u8>>)> {
    if record.len() != record_len(key_len, val_len) {
        return Err(VaultError::crypto("record length inconsistent with slot"));
    }
    verify_record(master, record)?;

    let mtime = u64::from_le_bytes(record[0..8].try_into().expect("slice length is 8"));
    let entry_type = record[8];

    let ct_start = RECORD_HEADER_SIZE + key_len;
    let nonce_start = record.len() - HASH_SIZE - NONCE_SIZE;
    let sealed = &record[ct_start..nonce_start];
    let nonce: [u8; NONCE_SIZE] = record[nonce_start..record.len() - HASH_SIZE]
        .try_into()
        .expect("slice length is 24");

    let value = crypto::open_sealed(master, &nonce, sealed)?;
    Ok((mtime, entry_type, value))
}

/// Returns a copy of `record` with `mtime` overwritten and the MAC restamped.
///
/// Used when importing a server blob: the caller verifies the incoming MAC
/// first, then the local modification time replaces whatever the blob
/// carried and the MAC is recomputed to cover it.
#[must_use]
pub fn restamp_record(master: &[u8; MASTER_KEY_SIZE], record: &[u8], mtime: u64) -> Vec<u8> {
    let mut out = record.to_vec();
    out[0..8].copy_from_slice(&mtime.to_le_bytes());
    let mac_start = out.len() - HASH_SIZE;
    let mac = crypto::keyed_hash(master, &out[..mac_start]);
    out[mac_start..].copy_from_slice(&mac);
    out
}

/// The key bytes embedded in a record.
#[must_use]
pub fn key_bytes(record: &[u8], key_len: usize) -> &[u8] {
    &record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len]
}
