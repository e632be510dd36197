//! Byte source/sink traits: the engine's view of "where content comes from"
//! and "where it goes", kept deliberately thin so the core never resolves a
//! path or a file-extension convention itself.

use std::fs::File;
use std::io::{self, Read, Stdin, Write};

/// A finite, forward-only stream of bytes.
///
/// The engine reads a source in block-sized chunks; a short read (fewer
/// bytes than requested) signals end-of-stream, matching the contract
/// `std::io::Read::read` already gives for a single call, generalized here
/// to "keep calling until the buffer is full or the stream is exhausted".
pub trait ByteSource {
    /// Fill as much of `buf` as the stream has left, returning how many
    /// bytes were actually written into it. `0` means end-of-stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A forward-only writable stream.
pub trait ByteSink {
    /// Write `data` in order. Implementors that buffer internally should
    /// flush on `Drop`, the way `std::fs::File` already does at the OS level.
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
}

fn fill_from<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

impl ByteSource for File {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        fill_from(self, buf)
    }
}

impl ByteSource for Stdin {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        fill_from(self, buf)
    }
}

impl ByteSink for File {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)
    }
}
