//! Tombstone compaction.
//!
//! Append-with-tombstone fills the slot table over time; when an append
//! finds no unused slot, compaction repacks every live record to the front
//! of a doubled slot table and drops the tombstones. The pass is the only
//! expensive mutation the engine has, which keeps adds, updates, and
//! deletes cheap the rest of the time.

use crate::error::{VaultError, VaultResult};

use super::file::VaultFile;
use super::format::{heap_offset, HASH_SIZE, MASTER_KEY_SIZE, OFF_SLOT_COUNT, SLOT_SIZE};
use super::slots::Slot;

/// Repacks live records, doubles the slot table, and trims the file.
///
/// Scans the old table up to its first `UNUSED` slot, copies each `ACTIVE`
/// record into a packed heap, rewrites the slots contiguously at the head
/// of the doubled table, zero-fills the remainder, truncates, and restamps
/// the file MAC. The heap is written before the enlarged table is
/// committed in the header; crash-atomicity is not promised — a torn
/// compaction surfaces as a MAC failure on the next open.
///
/// The caller must rebuild its key index afterwards: every surviving
/// record has moved.
///
/// # Errors
///
/// - [`VaultError::Io`] if a read, write, or resize fails.
/// - [`VaultError::FileIntegrity`] if a slot points outside the heap.
pub fn compact(file: &VaultFile, master: &[u8; MASTER_KEY_SIZE]) -> VaultResult<u32> {
    let old_count = file.slot_count()?;
    if old_count == 0 || !old_count.is_power_of_two() {
        return Err(VaultError::integrity("slot count is not a positive power of two"));
    }
    let old_heap = heap_offset(old_count);
    let len = file.len()?;
    if len < old_heap + HASH_SIZE as u64 {
        return Err(VaultError::integrity("vault file shorter than its slot table"));
    }
    let data_end = len - HASH_SIZE as u64;

    let mut table = vec![0u8; old_count as usize * SLOT_SIZE];
    file.read_exact_at(&mut table, heap_offset(0))?;

    let heap_len = usize::try_from(data_end - old_heap)
        .map_err(|_| VaultError::integrity("record heap larger than addressable"))?;
    let mut heap = vec![0u8; heap_len];
    file.read_exact_at(&mut heap, old_heap)?;

    let new_count = old_count * 2;
    let new_heap = heap_offset(new_count);

    let mut packed: Vec<u8> = Vec::with_capacity(heap_len);
    let mut live: Vec<Slot> = Vec::new();
    for chunk in table.chunks_exact(SLOT_SIZE) {
        let slot = Slot::decode(chunk.try_into().expect("chunk is SLOT_SIZE"));
        if slot.is_unused() {
            break;
        }
        if !slot.is_active() {
            continue;
        }

        let start = u64::from(slot.file_offset)
            .checked_sub(old_heap)
            .and_then(|s| usize::try_from(s).ok())
            .ok_or_else(|| VaultError::integrity("slot points before the record heap"))?;
        let end = start
            .checked_add(slot.record_len())
            .filter(|&e| e <= heap.len())
            .ok_or_else(|| VaultError::integrity("slot points past the record heap"))?;

        let new_offset = u32::try_from(new_heap + packed.len() as u64)
            .map_err(|_| VaultError::integrity("compacted heap exceeds addressable size"))?;
        live.push(Slot::active(new_offset, slot.key_len, slot.val_len));
        packed.extend_from_slice(&heap[start..end]);
    }

    // Data region first, then the enlarged table takes effect.
    file.write_all_at(&packed, new_heap)?;
    file.write_all_at(&new_count.to_le_bytes(), OFF_SLOT_COUNT)?;

    let mut new_table = vec![0u8; new_count as usize * SLOT_SIZE];
    for (i, slot) in live.iter().enumerate() {
        new_table[i * SLOT_SIZE..(i + 1) * SLOT_SIZE].copy_from_slice(&slot.encode());
    }
    file.write_all_at(&new_table, heap_offset(0))?;

    file.rewrite_mac(master, new_heap + packed.len() as u64)?;

    log::debug!(
        "compacted vault: {} live records, slot table {} -> {}",
        live.len(),
        old_count,
        new_count
    );
    Ok(new_count)
}
