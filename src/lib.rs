//! `blockarc`: a single-file archive container with a FAT-style allocation
//! table — a small block device with a fixed-size directory at offset zero
//! and fixed-size payload blocks after it.
//!
//! The seven operations (`create`, `list`, `extract`, `append`, `delete`,
//! `update`, `pack`) live as methods on [`Archive`]; this crate does not
//! parse command-line arguments or resolve file paths on its own — callers
//! hand it [`ByteSource`]/[`ByteSink`] implementations (see [`io_ext`]) for
//! wherever member content actually lives.
#![deny(missing_docs)]

pub mod device;
pub mod engine;
pub mod error;
pub mod io_ext;
pub mod table;

pub use device::Device;
pub use engine::{Archive, Listing};
pub use error::{ArchiveError, Diagnostic};
pub use io_ext::{ByteSink, ByteSource};
