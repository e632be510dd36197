//! Allocation table: the fixed-size directory and free list persisted at
//! offset 0 of every archive.
//!
//! Mirrors the teacher's `SuperBlock`/`DInode` pattern — a `#[derive]`d
//! struct serialized whole, through `bincode`, into a single fixed-size
//! blob — generalized with `serde-big-array` where a field's array is
//! longer than serde's derive macro natively supports.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::HashSet;

use crate::device::Device;
use crate::error::ArchiveError;

/// Size of one block, in bytes (256 KiB).
pub const BLOCK_SIZE: u64 = 256 * 1024;

/// Maximum number of member files one archive can hold.
pub const MAX_ENTRIES: usize = 100;

/// Maximum number of blocks a single entry may occupy (16 MiB per file).
pub const MAX_BLOCKS_PER_ENTRY: usize = 64;

/// Capacity of the free list: one slot for every block any entry could ever
/// claim at once.
pub const FREE_LIST_CAPACITY: usize = MAX_ENTRIES * MAX_BLOCKS_PER_ENTRY;

/// Fixed width of a stored member name, including its `0x00` terminator.
pub const NAME_SIZE: usize = 256;

/// Tombstone value marking a free-list slot as already claimed.
///
/// Never collides with a real block offset: the block region always starts
/// at `FIRST_BLOCK_OFFSET`, which is strictly positive.
const TOMBSTONE: u64 = 0;

/// 4-byte magic identifying this format, written ahead of the allocation
/// table so `load` can fail fast on a foreign file instead of
/// misinterpreting its bytes as a table.
const MAGIC: [u8; 4] = *b"BARC";

/// Format version, bumped whenever the on-disk layout changes incompatibly.
const FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: u64 = 4 + 2;

const ENTRY_SIZE: u64 = NAME_SIZE as u64 + 8 + (MAX_BLOCKS_PER_ENTRY as u64 * 8) + 8;

const AT_SIZE: u64 =
    (MAX_ENTRIES as u64 * ENTRY_SIZE) + 8 + (FREE_LIST_CAPACITY as u64 * 8) + 8;

/// Byte offset where the first real block lives, and every other block
/// offset must be congruent to, modulo `BLOCK_SIZE`.
pub const FIRST_BLOCK_OFFSET: u64 = HEADER_SIZE + AT_SIZE;

/// One directory slot: a member's name, total size, and the ordered blocks
/// that hold its content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    #[serde(with = "BigArray")]
    name: [u8; NAME_SIZE],
    size: u64,
    #[serde(with = "BigArray")]
    block_offsets: [u64; MAX_BLOCKS_PER_ENTRY],
    block_count: u64,
}

impl Default for DirEntry {
    fn default() -> Self {
        DirEntry {
            name: [0; NAME_SIZE],
            size: 0,
            block_offsets: [0; MAX_BLOCKS_PER_ENTRY],
            block_count: 0,
        }
    }
}

impl DirEntry {
    fn named(name: &str) -> Result<DirEntry, ArchiveError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_SIZE - 1 {
            return Err(ArchiveError::SourceUnreadable(format!(
                "member name '{}' must be 1..={} bytes",
                name,
                NAME_SIZE - 1
            )));
        }
        let mut packed = [0u8; NAME_SIZE];
        packed[..bytes.len()].copy_from_slice(bytes);
        let mut entry = DirEntry::default();
        entry.name = packed;
        Ok(entry)
    }

    /// This entry's name, decoded up to its terminator.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Total content size, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of blocks currently backing this entry.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// This entry's block offsets, in logical (content) order.
    pub fn block_offsets(&self) -> &[u64] {
        &self.block_offsets[..self.block_count as usize]
    }

    fn push_block(&mut self, offset: u64) -> Result<(), ArchiveError> {
        if self.block_count as usize == MAX_BLOCKS_PER_ENTRY {
            return Err(ArchiveError::EntryFull);
        }
        self.block_offsets[self.block_count as usize] = offset;
        self.block_count += 1;
        Ok(())
    }

    fn clear_blocks(&mut self) {
        self.block_offsets = [0; MAX_BLOCKS_PER_ENTRY];
        self.block_count = 0;
        self.size = 0;
    }
}

/// The free list: an unordered bag of reclaimable block offsets.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct FreeList {
    #[serde(with = "BigArray")]
    offsets: [u64; FREE_LIST_CAPACITY],
    len: u64,
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList {
            offsets: [0; FREE_LIST_CAPACITY],
            len: 0,
        }
    }
}

impl FreeList {
    /// Claim the first non-tombstone slot, linear-scanning from the start,
    /// tombstoning it in place.
    fn acquire(&mut self) -> Option<u64> {
        for i in 0..self.len as usize {
            if self.offsets[i] != TOMBSTONE {
                let offset = self.offsets[i];
                self.offsets[i] = TOMBSTONE;
                return Some(offset);
            }
        }
        None
    }

    /// Append a newly grown block's offset. Used only right after the
    /// backing file itself has grown, so there is always room unless the
    /// free list is already at capacity.
    fn push_new(&mut self, offset: u64) -> Result<(), ArchiveError> {
        if self.len as usize == FREE_LIST_CAPACITY {
            return Err(ArchiveError::FreeListFull);
        }
        self.offsets[self.len as usize] = offset;
        self.len += 1;
        Ok(())
    }

    /// Release a block back to the list, compacting tombstones out first if
    /// there isn't room to simply append.
    fn release(&mut self, offset: u64) -> Result<(), ArchiveError> {
        if (self.len as usize) == FREE_LIST_CAPACITY {
            self.compact();
        }
        if (self.len as usize) == FREE_LIST_CAPACITY {
            return Err(ArchiveError::FreeListFull);
        }
        self.offsets[self.len as usize] = offset;
        self.len += 1;
        Ok(())
    }

    fn compact(&mut self) {
        let mut write = 0;
        for read in 0..self.len as usize {
            if self.offsets[read] != TOMBSTONE {
                self.offsets[write] = self.offsets[read];
                write += 1;
            }
        }
        for slot in self.offsets[write..self.len as usize].iter_mut() {
            *slot = TOMBSTONE;
        }
        self.len = write as u64;
    }

    fn clear(&mut self) {
        self.offsets = [0; FREE_LIST_CAPACITY];
        self.len = 0;
    }
}

/// The allocation table: the fixed-size directory plus free list read from
/// and written to offset 0 of the backing file as a single blob.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AllocationTable {
    #[serde(with = "BigArray")]
    entries: [DirEntry; MAX_ENTRIES],
    entry_count: u64,
    free: FreeList,
}

impl Default for AllocationTable {
    fn default() -> Self {
        AllocationTable {
            entries: std::array::from_fn(|_| DirEntry::default()),
            entry_count: 0,
            free: FreeList::default(),
        }
    }
}

impl AllocationTable {
    /// A freshly initialized table for a brand new archive: no entries, one
    /// free block at `FIRST_BLOCK_OFFSET` (the first block the backing file
    /// will grow to hold).
    pub fn fresh() -> AllocationTable {
        let mut table = AllocationTable::default();
        table.free.offsets[0] = FIRST_BLOCK_OFFSET;
        table.free.len = 1;
        table
    }

    /// Read and deserialize the table from `device`, checking the format
    /// header and every structural invariant before returning it.
    pub fn load(device: &Device) -> Result<AllocationTable, ArchiveError> {
        if device.len() < HEADER_SIZE + AT_SIZE {
            return Err(ArchiveError::CorruptHeader(format!(
                "backing file is {} bytes, shorter than the {}-byte header and table",
                device.len(),
                HEADER_SIZE + AT_SIZE
            )));
        }
        let bytes = device.read_at(0, HEADER_SIZE + AT_SIZE)?;
        if bytes[0..4] != MAGIC[..] {
            return Err(ArchiveError::CorruptHeader(
                "missing archive magic".to_string(),
            ));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(ArchiveError::CorruptHeader(format!(
                "unsupported format version {}",
                version
            )));
        }
        let table: AllocationTable = bincode::deserialize(&bytes[HEADER_SIZE as usize..])?;
        table.validate(device.len())?;
        Ok(table)
    }

    /// Serialize the table, with its header, and write it to offset 0.
    pub fn store(&self, device: &mut Device) -> Result<(), ArchiveError> {
        let mut bytes = Vec::with_capacity((HEADER_SIZE + AT_SIZE) as usize);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&bincode::serialize(self)?);
        debug_assert_eq!(bytes.len() as u64, HEADER_SIZE + AT_SIZE);
        device.write_at(0, &bytes)
    }

    fn validate(&self, device_len: u64) -> Result<(), ArchiveError> {
        if self.entry_count as usize > MAX_ENTRIES {
            return Err(ArchiveError::CorruptHeader(format!(
                "entry_count {} exceeds capacity {}",
                self.entry_count, MAX_ENTRIES
            )));
        }
        if self.free.len as usize > FREE_LIST_CAPACITY {
            return Err(ArchiveError::CorruptHeader(format!(
                "free_count {} exceeds capacity {}",
                self.free.len, FREE_LIST_CAPACITY
            )));
        }

        let mut seen = HashSet::new();
        let check_offset = |offset: u64, seen: &mut HashSet<u64>| -> Result<(), ArchiveError> {
            if offset < FIRST_BLOCK_OFFSET || (offset - FIRST_BLOCK_OFFSET) % BLOCK_SIZE != 0 {
                return Err(ArchiveError::CorruptHeader(format!(
                    "block offset {} is not aligned to the block region",
                    offset
                )));
            }
            if offset + BLOCK_SIZE > device_len {
                return Err(ArchiveError::CorruptHeader(format!(
                    "block offset {} falls past the end of the backing file",
                    offset
                )));
            }
            if !seen.insert(offset) {
                return Err(ArchiveError::CorruptHeader(format!(
                    "block offset {} is claimed more than once",
                    offset
                )));
            }
            Ok(())
        };

        for entry in self.entries() {
            let min_blocks = if entry.size == 0 {
                0
            } else {
                (entry.size + BLOCK_SIZE - 1) / BLOCK_SIZE
            };
            if entry.block_count < min_blocks || entry.block_count as usize > MAX_BLOCKS_PER_ENTRY
            {
                return Err(ArchiveError::CorruptHeader(format!(
                    "entry '{}' has {} blocks, inconsistent with size {}",
                    entry.name(),
                    entry.block_count,
                    entry.size
                )));
            }
            if (entry.block_count == 0) != (entry.size == 0) {
                return Err(ArchiveError::CorruptHeader(format!(
                    "entry '{}' has a zero/non-zero size and block_count mismatch",
                    entry.name()
                )));
            }
            for &offset in entry.block_offsets() {
                check_offset(offset, &mut seen)?;
            }
        }

        for i in 0..self.free.len as usize {
            let offset = self.free.offsets[i];
            if offset == TOMBSTONE {
                continue;
            }
            check_offset(offset, &mut seen)?;
        }

        Ok(())
    }

    /// Every entry currently in the directory, in storage order.
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries[..self.entry_count as usize].iter()
    }

    /// Number of entries currently in the directory.
    pub fn entry_count(&self) -> usize {
        self.entry_count as usize
    }

    /// The entry named `name`, if present.
    pub fn entry(&self, name: &str) -> Option<&DirEntry> {
        self.find_entry_index(name).map(|i| &self.entries[i])
    }

    fn find_entry_index(&self, name: &str) -> Option<usize> {
        self.entries[..self.entry_count as usize]
            .iter()
            .position(|e| e.name() == name)
    }

    fn create_entry(&mut self, name: &str) -> Result<usize, ArchiveError> {
        if self.entry_count as usize == MAX_ENTRIES {
            return Err(ArchiveError::TableFull);
        }
        let idx = self.entry_count as usize;
        self.entries[idx] = DirEntry::named(name)?;
        self.entry_count += 1;
        Ok(idx)
    }

    fn remove_entry(&mut self, idx: usize) {
        let n = self.entry_count as usize;
        for i in idx..n - 1 {
            self.entries.swap(i, i + 1);
        }
        self.entry_count -= 1;
    }

    /// Record one freshly written block as belonging to `name`'s entry,
    /// creating the entry if this is its first block.
    pub fn record_block(&mut self, name: &str, offset: u64, bytes_written: u64) -> Result<(), ArchiveError> {
        let idx = match self.find_entry_index(name) {
            Some(idx) => idx,
            None => self.create_entry(name)?,
        };
        self.entries[idx].push_block(offset)?;
        self.entries[idx].size += bytes_written;
        Ok(())
    }

    /// Make sure `name` has a directory slot, creating an empty entry
    /// (`size == 0`, `block_count == 0`) if none exists yet. A no-op if the
    /// entry is already present, whether empty or not — this only exists so
    /// a source that turns out to have zero bytes still gets an entry.
    pub fn ensure_entry(&mut self, name: &str) -> Result<(), ArchiveError> {
        if self.find_entry_index(name).is_some() {
            return Ok(());
        }
        self.create_entry(name)?;
        Ok(())
    }

    /// Remove `name`'s entry entirely, releasing all of its blocks.
    pub fn delete_entry(&mut self, name: &str) -> Result<(), ArchiveError> {
        let idx = self
            .find_entry_index(name)
            .ok_or_else(|| ArchiveError::NotFound(name.to_string()))?;
        let offsets: Vec<u64> = self.entries[idx].block_offsets().to_vec();
        for offset in offsets {
            self.free.release(offset)?;
        }
        self.remove_entry(idx);
        Ok(())
    }

    /// Release `name`'s current content (blocks and size) but keep its
    /// directory slot, ready to be rewritten by a fresh append.
    pub fn reset_entry(&mut self, name: &str) -> Result<(), ArchiveError> {
        let idx = self
            .find_entry_index(name)
            .ok_or_else(|| ArchiveError::NotFound(name.to_string()))?;
        let offsets: Vec<u64> = self.entries[idx].block_offsets().to_vec();
        for offset in offsets {
            self.free.release(offset)?;
        }
        self.entries[idx].clear_blocks();
        Ok(())
    }

    /// This entry's block offsets, by index (for `pack`, which walks entries
    /// by position rather than by name).
    pub fn entry_block_offsets(&self, idx: usize) -> &[u64] {
        self.entries[idx].block_offsets()
    }

    /// Overwrite entry `idx`'s block offsets in place (for `pack`, after
    /// relocating its blocks).
    pub fn set_entry_block_offsets(&mut self, idx: usize, offsets: &[u64]) {
        for (slot, &offset) in self.entries[idx].block_offsets[..offsets.len()]
            .iter_mut()
            .zip(offsets)
        {
            *slot = offset;
        }
    }

    /// Claim a free block, growing the backing file first if none remain.
    pub fn acquire_block(&mut self, device: &mut Device) -> Result<u64, ArchiveError> {
        if let Some(offset) = self.free.acquire() {
            return Ok(offset);
        }
        self.expand(device)?;
        self.free
            .acquire()
            .ok_or(ArchiveError::FreeListFull)
    }

    fn expand(&mut self, device: &mut Device) -> Result<(), ArchiveError> {
        let new_block_offset = device.len();
        device.resize(new_block_offset + BLOCK_SIZE)?;
        self.free.push_new(new_block_offset)
    }

    /// Drop every free-list entry, leaving the directory's own bookkeeping
    /// as the only reachable blocks (used by `pack`, right before the
    /// backing file is truncated to the new, compacted length).
    pub fn clear_free_list(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_size_matches_const_arithmetic() {
        let bytes = bincode::serialize(&AllocationTable::default()).unwrap();
        assert_eq!(bytes.len() as u64, AT_SIZE);
    }

    #[test]
    fn fresh_table_has_one_free_block() {
        let table = AllocationTable::fresh();
        assert_eq!(table.entry_count(), 0);
        assert_eq!(table.free.len, 1);
        assert_eq!(table.free.offsets[0], FIRST_BLOCK_OFFSET);
    }

    #[test]
    fn acquire_then_release_reuses_tombstone_before_growing() {
        let mut table = AllocationTable::fresh();
        let mut free = FreeList::default();
        free.offsets[0] = 100;
        free.offsets[1] = 200;
        free.len = 2;
        table.free = free;

        let first = table.free.acquire().unwrap();
        assert_eq!(first, 100);
        table.free.release(first).unwrap();
        let reacquired = table.free.acquire().unwrap();
        assert_eq!(reacquired, 100);
    }

    #[test]
    fn record_block_creates_then_extends_entry() {
        let mut table = AllocationTable::fresh();
        table
            .record_block("a.txt", FIRST_BLOCK_OFFSET, 10)
            .unwrap();
        table
            .record_block("a.txt", FIRST_BLOCK_OFFSET + BLOCK_SIZE, 5)
            .unwrap();
        let entry = table.entry("a.txt").unwrap();
        assert_eq!(entry.size(), 15);
        assert_eq!(entry.block_count(), 2);
    }

    #[test]
    fn delete_entry_frees_its_blocks() {
        let mut table = AllocationTable::fresh();
        table
            .record_block("a.txt", FIRST_BLOCK_OFFSET, BLOCK_SIZE)
            .unwrap();
        table.delete_entry("a.txt").unwrap();
        assert_eq!(table.entry_count(), 0);
        assert_eq!(table.free.acquire(), Some(FIRST_BLOCK_OFFSET));
    }

    #[test]
    fn delete_missing_entry_is_not_found() {
        let mut table = AllocationTable::fresh();
        let err = table.delete_entry("missing").unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[test]
    fn oversized_name_is_source_unreadable() {
        let mut table = AllocationTable::fresh();
        let long_name = "x".repeat(NAME_SIZE);
        let err = table
            .record_block(&long_name, FIRST_BLOCK_OFFSET, 1)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SourceUnreadable(_)));
    }

    #[test]
    fn table_full_after_max_entries() {
        let mut table = AllocationTable::fresh();
        for i in 0..MAX_ENTRIES {
            table
                .record_block(&format!("f{}", i), FIRST_BLOCK_OFFSET, 1)
                .unwrap();
        }
        let err = table
            .record_block("one-too-many", FIRST_BLOCK_OFFSET, 1)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::TableFull));
    }

    #[test]
    fn entry_full_after_max_blocks() {
        let mut table = AllocationTable::fresh();
        for _ in 0..MAX_BLOCKS_PER_ENTRY {
            table.record_block("big", FIRST_BLOCK_OFFSET, 1).unwrap();
        }
        let err = table.record_block("big", FIRST_BLOCK_OFFSET, 1).unwrap_err();
        assert!(matches!(err, ArchiveError::EntryFull));
    }
}
