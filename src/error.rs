//! Error taxonomy for the archive engine.
//!
//! Mirrors the teacher's `error_given::APIError`: a `thiserror`-derived enum
//! with `#[from]` wiring for the I/O and serialization failures that bubble
//! up through `?`, plus a handful of archive-specific, string-carrying
//! variants for the structural failures spec.md calls out.

use thiserror::Error;

/// Every way an archive operation can fail.
///
/// `NotFound` and `SourceUnreadable` are the two per-member kinds: batch
/// operations (`create`/`append`/`delete`/`update`) collect these as
/// [`Diagnostic`]s and keep going. Every other variant is fatal and aborts
/// the operation immediately.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Any read/write/truncate/open failure against the backing store or an
    /// external source/sink.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The allocation table could not be (de)serialized.
    #[error("failed to (de)serialize the allocation table: {0}")]
    Serialize(#[from] bincode::Error),

    /// The loaded allocation table failed one of its structural invariants.
    #[error("corrupt allocation table: {0}")]
    CorruptHeader(String),

    /// Adding a new entry when the directory is already at capacity.
    #[error("archive directory is full")]
    TableFull,

    /// An entry would need more blocks than a single entry may hold.
    #[error("entry exceeds the maximum block count for one file")]
    EntryFull,

    /// The free list has no room left, even after compacting tombstones.
    #[error("free list is full")]
    FreeListFull,

    /// A named member is absent from the directory.
    #[error("member '{0}' not found in archive")]
    NotFound(String),

    /// A requested source could not be opened or read.
    #[error("could not read source '{0}'")]
    SourceUnreadable(String),
}

/// A non-fatal, per-member problem encountered during a batch operation.
///
/// Batch operations (`create`, `append`, `delete`, `update`) return a list
/// of these alongside their `Ok(())`; a fatal error short-circuits the whole
/// batch instead and comes back as `Err(ArchiveError)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Name of the member this diagnostic is about.
    pub member: String,
    /// Human-readable description of what went wrong.
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn not_found(member: &str) -> Diagnostic {
        Diagnostic {
            member: member.to_string(),
            message: format!("member '{}' not found", member),
        }
    }

    pub(crate) fn source_unreadable(member: &str, reason: impl std::fmt::Display) -> Diagnostic {
        Diagnostic {
            member: member.to_string(),
            message: format!("could not read source for '{}': {}", member, reason),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
