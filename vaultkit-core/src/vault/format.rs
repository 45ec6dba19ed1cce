//! File format constants and layout arithmetic.
//!
//! A vault is a single file laid out as follows, all integers little-endian:
//!
//! ```text
//! Offset      Size    Field
//! ------      ----    -----
//! 0           1       version
//! 1           7       reserved (zero)
//! 8           16      password salt
//! 24          48      encrypted master key (32 ct + 16 tag)
//! 72          24      master nonce
//! 96          8       last_server_time (u64 LE)
//! 104         4       slot count N (u32 LE)
//! 108         16*N    slot table
//! 108+16N     ...     record heap
//! EOF-32      32      file MAC (keyed hash over everything before it)
//! ```
//!
//! Bytes `[0, 104)` form the header that is uploaded to the sync server.

/// Current vault file format version.
pub const VERSION: u8 = 1;

/// Size of a password salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of the master key (and every derived key) in bytes.
pub const MASTER_KEY_SIZE: usize = 32;

/// Size of an AEAD authentication tag in bytes.
pub const MAC_SIZE: usize = 16;

/// Size of an AEAD nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of a keyed-hash output in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of the sealed master-key envelope: ciphertext plus tag.
pub const ENC_MASTER_SIZE: usize = MASTER_KEY_SIZE + MAC_SIZE;

/// Size of one slot-table entry in bytes.
pub const SLOT_SIZE: usize = 16;

/// Size of the full header including the slot count.
pub const HEADER_SIZE: usize = 108;

/// Size of the header prefix uploaded to the server: bytes `[0, 104)`.
pub const SERVER_HEADER_SIZE: usize = HEADER_SIZE - 4;

/// Size of the fixed record prefix: mtime (8) plus type (1).
pub const RECORD_HEADER_SIZE: usize = 9;

/// Number of slots in a freshly created vault. Doubles on every compaction.
pub const INITIAL_SLOT_COUNT: u32 = 16;

/// Size of the hot-box key buffer; keys are at most one byte shorter.
pub const BOX_KEY_SIZE: usize = 128;

/// Longest permitted key, in bytes.
pub const MAX_KEY_LEN: usize = BOX_KEY_SIZE - 1;

/// Longest permitted value, in bytes.
pub const DATA_SIZE: usize = 4096;

/// Longest permitted directory argument, in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Longest permitted username, in bytes.
pub const MAX_USER_SIZE: usize = 128;

/// Longest permitted password or recovery answer, in bytes.
pub const MAX_PASS_SIZE: usize = 256;

/// Slot state: never used; ends the allocation scan.
pub const STATE_UNUSED: u32 = 0;

/// Slot state: the referenced record is live.
///
/// An opaque sentinel; compared only by strict equality.
pub const STATE_ACTIVE: u32 = 0x0001_0001;

/// Slot state: tombstone whose record value has been wiped.
pub const STATE_DELETED: u32 = 1;

/// Byte offset of the password salt within the header.
pub const OFF_SALT: u64 = 8;

/// Byte offset of the sealed master key within the header.
pub const OFF_ENC_MASTER: u64 = 24;

/// Byte offset of the master nonce within the header.
pub const OFF_MASTER_NONCE: u64 = 72;

/// Byte offset of the last-server-time field within the header.
pub const OFF_SERVER_TIME: u64 = 96;

/// Byte offset of the slot count within the header.
pub const OFF_SLOT_COUNT: u64 = 104;

/// Byte offset of the slot at `index` within the file.
#[must_use]
pub const fn slot_offset(index: u32) -> u64 {
    HEADER_SIZE as u64 + index as u64 * SLOT_SIZE as u64
}

/// Byte offset of the record heap for a table of `slot_count` slots.
#[must_use]
pub const fn heap_offset(slot_count: u32) -> u64 {
    slot_offset(slot_count)
}

/// Total encoded size of a record with the given key and value lengths.
#[must_use]
pub const fn record_len(key_len: usize, val_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + val_len + MAC_SIZE + NONCE_SIZE + HASH_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(ENC_MASTER_SIZE, 48);
        assert_eq!(SERVER_HEADER_SIZE, 104);
        assert_eq!(RECORD_HEADER_SIZE, 9);
        // Header fields tile the server header exactly.
        assert_eq!(
            1 + 7 + SALT_SIZE + ENC_MASTER_SIZE + NONCE_SIZE + 8,
            SERVER_HEADER_SIZE
        );
        assert_eq!(OFF_SLOT_COUNT as usize + 4, HEADER_SIZE);
        assert!(INITIAL_SLOT_COUNT.is_power_of_two());
    }

    #[test]
    fn test_slot_arithmetic() {
        assert_eq!(slot_offset(0), 108);
        assert_eq!(slot_offset(1), 124);
        assert_eq!(heap_offset(INITIAL_SLOT_COUNT), 108 + 16 * 16);
    }

    #[test]
    fn test_record_len() {
        // S1 from the design scenarios: key "email" (5), value "a@b.com" (7).
        assert_eq!(record_len(5, 7), 9 + 5 + 7 + 16 + 24 + 32);
    }
}
