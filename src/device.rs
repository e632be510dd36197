//! Backing store: a resizable, memory-mapped file an archive is built on.
//!
//! Generalizes the teacher's fixed-size `controller::Device`: an archive
//! grows as members are appended and shrinks when it is packed, so the
//! mapping is torn down and recreated around every resize instead of being
//! fixed at construction time.

use memmap::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::ArchiveError;

/// A single backing file opened for positioned reads and writes.
///
/// Holds no knowledge of the allocation table or block layout; `table` and
/// `engine` are the only callers that interpret offsets.
pub struct Device {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    len: u64,
}

impl Device {
    /// Create a fresh, empty backing file at `path`, truncating it to
    /// nothing first if one already exists there.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Device, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Device {
            path,
            file,
            map: None,
            len: 0,
        })
    }

    /// Open an existing backing file at `path` for read and write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Device, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let mut device = Device {
            path,
            file,
            map: None,
            len: 0,
        };
        device.remap(len)?;
        Ok(device)
    }

    fn remap(&mut self, len: u64) -> Result<(), ArchiveError> {
        self.map = None;
        self.len = len;
        if len == 0 {
            return Ok(());
        }
        let map = unsafe { MmapOptions::new().len(len as usize).map_mut(&self.file)? };
        self.map = Some(map);
        Ok(())
    }

    /// Current length of the backing file, in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grow or shrink the backing file to exactly `new_len` bytes, remapping
    /// it afterwards.
    pub fn resize(&mut self, new_len: u64) -> Result<(), ArchiveError> {
        self.map = None;
        self.file.set_len(new_len)?;
        self.remap(new_len)
    }

    /// Read exactly `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), ArchiveError> {
        let map = self.mapped()?;
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| out_of_bounds(offset, buf.len() as u64, self.len))?;
        if end > map.len() {
            return Err(out_of_bounds(offset, buf.len() as u64, self.len));
        }
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    }

    /// Read exactly `len` bytes starting at `offset`, returning a freshly
    /// allocated buffer.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, ArchiveError> {
        let mut buf = vec![0u8; len as usize];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`, without changing the file's length.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ArchiveError> {
        let len = self.len;
        let map = self.mapped_mut()?;
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| out_of_bounds(offset, data.len() as u64, len))?;
        if end > map.len() {
            return Err(out_of_bounds(offset, data.len() as u64, len));
        }
        map[start..end].copy_from_slice(data);
        Ok(())
    }

    fn mapped(&self) -> Result<&MmapMut, ArchiveError> {
        self.map
            .as_ref()
            .ok_or_else(|| empty_device_error())
    }

    fn mapped_mut(&mut self) -> Result<&mut MmapMut, ArchiveError> {
        self.map
            .as_mut()
            .ok_or_else(|| empty_device_error())
    }
}

fn out_of_bounds(offset: u64, len: u64, device_len: u64) -> ArchiveError {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!(
            "range [{}, {}) is out of bounds for a device of length {}",
            offset,
            offset + len,
            device_len
        ),
    )
    .into()
}

fn empty_device_error() -> ArchiveError {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "device is empty").into()
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(map) = self.map.as_ref() {
            let _ = map.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prep_path(test_name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-tests");
        std::fs::create_dir_all(&path).unwrap();
        path.push(format!("{}.img", test_name));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn destruct(path: PathBuf) {
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn create_then_resize_and_write() {
        let path = prep_path("device_create_resize");
        let mut device = Device::create(&path).unwrap();
        assert_eq!(device.len(), 0);
        device.resize(4096).unwrap();
        assert_eq!(device.len(), 4096);
        device.write_at(10, b"hello").unwrap();
        let read = device.read_at(10, 5).unwrap();
        assert_eq!(&read, b"hello");
        destruct(path);
    }

    #[test]
    fn reopen_preserves_contents() {
        let path = prep_path("device_reopen");
        {
            let mut device = Device::create(&path).unwrap();
            device.resize(1024).unwrap();
            device.write_at(0, b"abc").unwrap();
        }
        {
            let device = Device::open(&path).unwrap();
            assert_eq!(device.len(), 1024);
            let read = device.read_at(0, 3).unwrap();
            assert_eq!(&read, b"abc");
        }
        destruct(path);
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let path = prep_path("device_oob");
        let mut device = Device::create(&path).unwrap();
        device.resize(16).unwrap();
        assert!(device.read_at(10, 16).is_err());
        destruct(path);
    }
}
