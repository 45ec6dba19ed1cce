//! Slot-table entries.
//!
//! The slot table sits directly after the header: `slot_count` entries of
//! 16 bytes each. A slot describes one record in the heap.
//!
//! # Binary Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     state (u32 LE)
//! 4       4     file_offset (u32 LE)
//! 8       4     key_len (u32 LE)
//! 12      4     val_len (u32 LE)
//! ```
//!
//! State is one of `STATE_UNUSED`, `STATE_ACTIVE`, `STATE_DELETED` and is
//! compared by strict equality only — the numeric values are opaque
//! sentinels. Unused slots are contiguous at the tail of the table; the
//! first unused slot ends every scan.

use super::format::{record_len, SLOT_SIZE, STATE_ACTIVE, STATE_DELETED, STATE_UNUSED};

/// One slot-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Lifecycle state; an opaque sentinel value.
    pub state: u32,
    /// Byte offset of the record in the file.
    pub file_offset: u32,
    /// Length of the record's key in bytes.
    pub key_len: u32,
    /// Length of the record's plaintext value in bytes.
    pub val_len: u32,
}

impl Slot {
    /// An all-zero, never-used slot.
    pub const UNUSED: Self = Self {
        state: STATE_UNUSED,
        file_offset: 0,
        key_len: 0,
        val_len: 0,
    };

    /// Creates an active slot describing a record at `file_offset`.
    #[must_use]
    pub const fn active(file_offset: u32, key_len: u32, val_len: u32) -> Self {
        Self {
            state: STATE_ACTIVE,
            file_offset,
            key_len,
            val_len,
        }
    }

    /// Encodes the slot to its on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..4].copy_from_slice(&self.state.to_le_bytes());
        buf[4..8].copy_from_slice(&self.file_offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.val_len.to_le_bytes());
        buf
    }

    /// Decodes a slot from its on-disk form.
    #[must_use]
    pub fn decode(bytes: &[u8; SLOT_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().expect("4 bytes"));
        Self {
            state: word(0),
            file_offset: word(4),
            key_len: word(8),
            val_len: word(12),
        }
    }

    /// Whether this slot has never been used.
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.state == STATE_UNUSED
    }

    /// Whether this slot references a live record.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state == STATE_ACTIVE
    }

    /// Whether this slot is a tombstone.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.state == STATE_DELETED
    }

    /// Total encoded size of the record this slot describes.
    #[must_use]
    pub const fn record_len(&self) -> usize {
        record_len(self.key_len as usize, self.val_len as usize)
    }
}
