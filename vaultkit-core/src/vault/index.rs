//! In-memory index of live keys.
//!
//! Maps each key to the byte offset of its slot plus the metadata the
//! listing operations need, so only `open_key` and the sync paths ever
//! touch record bytes. Rebuilt from the slot table on every open; never
//! persisted.

use std::collections::HashMap;

use crate::error::{VaultError, VaultResult};

use super::file::VaultFile;
use super::format::{slot_offset, RECORD_HEADER_SIZE};

/// Index metadata for one live key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    /// Byte offset of the key's slot within the file.
    pub slot_offset: u64,
    /// Modification time stored in the record.
    pub mtime: u64,
    /// Type tag stored in the record.
    pub entry_type: u8,
}

/// Map from key to slot location and metadata.
#[derive(Debug)]
pub struct KeyIndex {
    map: HashMap<String, KeyEntry>,
}

impl KeyIndex {
    /// Creates an empty index sized for a table of `slot_count` slots.
    ///
    /// Buckets start at half the slot count, the expected steady-state
    /// occupancy of an append-with-tombstone table.
    #[must_use]
    pub fn with_slot_count(slot_count: u32) -> Self {
        Self {
            map: HashMap::with_capacity((slot_count / 2) as usize),
        }
    }

    /// Rebuilds the index by scanning the slot table.
    ///
    /// Reads the mtime, type, and key of every `ACTIVE` slot's record. The
    /// scan ends at the first `UNUSED` slot; unused slots are contiguous at
    /// the table's tail.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Io`] if a read fails.
    /// - [`VaultError::FileIntegrity`] if a live record's key is not UTF-8.
    pub fn build_from_file(file: &VaultFile) -> VaultResult<Self> {
        let slot_count = file.slot_count()?;
        let mut index = Self::with_slot_count(slot_count);

        for i in 0..slot_count {
            let offset = slot_offset(i);
            let slot = file.read_slot(offset)?;
            if slot.is_unused() {
                break;
            }
            if !slot.is_active() {
                continue;
            }

            let mut head = vec![0u8; RECORD_HEADER_SIZE + slot.key_len as usize];
            file.read_exact_at(&mut head, u64::from(slot.file_offset))?;

            let mtime = u64::from_le_bytes(head[0..8].try_into().expect("slice length is 8"));
            let entry_type = head[8];
            let key = String::from_utf8(head[RECORD_HEADER_SIZE..].to_vec())
                .map_err(|_| VaultError::integrity("record key is not valid UTF-8"))?;

            index.map.insert(
                key,
                KeyEntry {
                    slot_offset: offset,
                    mtime,
                    entry_type,
                },
            );
        }
        Ok(index)
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KeyEntry> {
        self.map.get(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, key: String, entry: KeyEntry) {
        self.map.insert(key, entry);
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &str) -> Option<KeyEntry> {
        self.map.remove(key)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the vault holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All live keys, in unspecified order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }
}
