//! The archive engine: the seven directory operations, each following the
//! same three-step protocol — load the allocation table, mutate the backing
//! store and the table in memory, persist the table once at the end.

use log::{debug, trace};
use std::path::Path;

use crate::device::Device;
use crate::error::{ArchiveError, Diagnostic};
use crate::io_ext::{ByteSink, ByteSource};
use crate::table::{AllocationTable, BLOCK_SIZE, FIRST_BLOCK_OFFSET};

/// A mounted archive: a backing [`Device`] plus whatever allocation table
/// each operation loads from it for its own duration.
///
/// Not `Sync`: every operation is synchronous and single-threaded, as
/// spec.md's concurrency model requires.
pub struct Archive {
    device: Device,
}

/// One directory entry as reported by [`Archive::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    /// The member's name.
    pub name: String,
    /// Total content size, in bytes.
    pub size: u64,
    /// Number of blocks currently backing this member.
    pub block_count: u64,
}

impl Archive {
    /// Create a brand new archive at `path`, then append each of `sources`
    /// to it under the paired name.
    ///
    /// Per-source read failures are collected as diagnostics instead of
    /// aborting the whole creation; anything else (I/O failure against the
    /// new backing file, a full directory) aborts immediately and the
    /// partially-built file is left behind for the caller to clean up.
    pub fn create<P: AsRef<Path>>(
        path: P,
        sources: Vec<(String, Box<dyn ByteSource>)>,
    ) -> Result<(Archive, Vec<Diagnostic>), ArchiveError> {
        let mut device = Device::create(path)?;
        device.resize(FIRST_BLOCK_OFFSET)?;
        let mut table = AllocationTable::fresh();
        table.store(&mut device)?;
        let mut archive = Archive { device };

        let mut diagnostics = Vec::new();
        for (name, mut source) in sources {
            if let Err(err) = archive.append_one(&mut table, &name, &mut *source) {
                push_or_abort(&mut diagnostics, &name, err)?;
            }
        }
        table.store(&mut archive.device)?;
        debug!("created archive with {} entries", table.entry_count());
        Ok((archive, diagnostics))
    }

    /// Open an existing archive at `path`, validating its allocation table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Archive, ArchiveError> {
        let device = Device::open(path)?;
        AllocationTable::load(&device)?;
        Ok(Archive { device })
    }

    /// List every member currently in the archive. Read-only; never mutates
    /// the backing file.
    pub fn list(&self) -> Result<Vec<Listing>, ArchiveError> {
        let table = AllocationTable::load(&self.device)?;
        Ok(table
            .entries()
            .map(|entry| Listing {
                name: entry.name(),
                size: entry.size(),
                block_count: entry.block_count(),
            })
            .collect())
    }

    /// Extract every member, handing each one's name to `open_sink` to get
    /// somewhere to write its content.
    ///
    /// The engine never decides where a member's bytes land on disk — that
    /// is `open_sink`'s job, keeping path resolution out of the core.
    pub fn extract<F>(&self, mut open_sink: F) -> Result<(), ArchiveError>
    where
        F: FnMut(&str) -> std::io::Result<Box<dyn ByteSink>>,
    {
        let table = AllocationTable::load(&self.device)?;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for entry in table.entries() {
            let mut sink = open_sink(&entry.name())?;
            let mut remaining = entry.size();
            for &offset in entry.block_offsets() {
                self.device.read_into(offset, &mut buf)?;
                let take = std::cmp::min(BLOCK_SIZE, remaining) as usize;
                sink.write_chunk(&buf[..take])?;
                remaining -= take as u64;
            }
            trace!("extracted '{}' ({} bytes)", entry.name(), entry.size());
        }
        Ok(())
    }

    /// Append `sources` to the archive: an unseen name becomes a new entry,
    /// a repeated name (including one a caller names `"stdin"` to match an
    /// existing `"stdin"` entry) grows the existing one with more blocks.
    pub fn append(
        &mut self,
        sources: Vec<(String, Box<dyn ByteSource>)>,
    ) -> Result<Vec<Diagnostic>, ArchiveError> {
        let mut table = AllocationTable::load(&self.device)?;
        let mut diagnostics = Vec::new();
        for (name, mut source) in sources {
            if let Err(err) = self.append_one(&mut table, &name, &mut *source) {
                push_or_abort(&mut diagnostics, &name, err)?;
            }
        }
        table.store(&mut self.device)?;
        Ok(diagnostics)
    }

    fn append_one(
        &mut self,
        table: &mut AllocationTable,
        name: &str,
        source: &mut dyn ByteSource,
    ) -> Result<(), ArchiveError> {
        table.ensure_entry(name)?;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        loop {
            let read = source.read_chunk(&mut buf)?;
            if read == 0 {
                break;
            }
            let offset = table.acquire_block(&mut self.device)?;
            if read < buf.len() {
                for byte in &mut buf[read..] {
                    *byte = 0;
                }
            }
            self.device.write_at(offset, &buf)?;
            table.record_block(name, offset, read as u64)?;
            debug!("wrote block for '{}' at offset {}", name, offset);
        }
        Ok(())
    }

    /// Delete each named member, releasing its blocks back to the free
    /// list. A name absent from the directory is reported as a diagnostic,
    /// not a fatal error.
    pub fn delete(&mut self, names: &[String]) -> Result<Vec<Diagnostic>, ArchiveError> {
        let mut table = AllocationTable::load(&self.device)?;
        let mut diagnostics = Vec::new();
        for name in names {
            match table.delete_entry(name) {
                Ok(()) => {}
                Err(ArchiveError::NotFound(_)) => diagnostics.push(Diagnostic::not_found(name)),
                Err(other) => return Err(other),
            }
        }
        table.store(&mut self.device)?;
        Ok(diagnostics)
    }

    /// Replace the content of each named entry with fresh bytes from
    /// `sources`, releasing its old blocks first. A name absent from the
    /// directory is reported as a diagnostic, not a fatal error.
    pub fn update(
        &mut self,
        sources: Vec<(String, Box<dyn ByteSource>)>,
    ) -> Result<Vec<Diagnostic>, ArchiveError> {
        let mut table = AllocationTable::load(&self.device)?;
        let mut diagnostics = Vec::new();
        for (name, mut source) in sources {
            match table.reset_entry(&name) {
                Ok(()) => {
                    if let Err(err) = self.append_one(&mut table, &name, &mut *source) {
                        push_or_abort(&mut diagnostics, &name, err)?;
                    }
                }
                Err(ArchiveError::NotFound(_)) => diagnostics.push(Diagnostic::not_found(&name)),
                Err(other) => return Err(other),
            }
        }
        table.store(&mut self.device)?;
        Ok(diagnostics)
    }

    /// Defragment the archive: relocate every live block into a contiguous
    /// prefix in directory order, drop the free list, and truncate away the
    /// reclaimed tail.
    ///
    /// Not atomic: a failure partway through leaves the backing file with
    /// some entries already relocated and others not, and the allocation
    /// table not yet restored to a consistent view of either.
    pub fn pack(&mut self) -> Result<(), ArchiveError> {
        let mut table = AllocationTable::load(&self.device)?;
        let mut cursor = FIRST_BLOCK_OFFSET;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];

        for idx in 0..table.entry_count() {
            let offsets: Vec<u64> = table.entry_block_offsets(idx).to_vec();
            let mut relocated = Vec::with_capacity(offsets.len());
            for offset in offsets {
                if offset != cursor {
                    self.device.read_into(offset, &mut buf)?;
                    self.device.write_at(cursor, &buf)?;
                }
                relocated.push(cursor);
                cursor += BLOCK_SIZE;
            }
            table.set_entry_block_offsets(idx, &relocated);
        }

        table.clear_free_list();
        self.device.resize(cursor)?;
        table.store(&mut self.device)?;
        debug!("packed archive down to {} bytes", cursor);
        Ok(())
    }
}

fn push_or_abort(
    diagnostics: &mut Vec<Diagnostic>,
    name: &str,
    err: ArchiveError,
) -> Result<(), ArchiveError> {
    match err {
        ArchiveError::SourceUnreadable(_) => {
            diagnostics.push(Diagnostic::source_unreadable(name, err));
            Ok(())
        }
        other => Err(other),
    }
}
