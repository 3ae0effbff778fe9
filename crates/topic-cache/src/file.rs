use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use memmap2::Mmap;

use crate::{Error, Result};

/// One append-only cache file: preallocated to capacity, written through
/// positioned writes, read through a shared read-only mapping.
///
/// Writers make bytes visible with a single atomic store of the published
/// length after the bytes themselves are written; readers never look past
/// the published length. Freezing a file ends its append lifetime, which
/// flips probes beyond the tail from "retry later" to "next segment".
pub struct CacheFile {
    path: PathBuf,
    file: File,
    map: Mmap,
    capacity: u32,
    published: AtomicU32,
    frozen: AtomicBool,
}

impl CacheFile {
    pub fn create(path: PathBuf, capacity: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;
        let map = unsafe { Mmap::map(&file)? };

        Ok(Self {
            path,
            file,
            map,
            capacity,
            published: AtomicU32::new(0),
            frozen: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn published(&self) -> u32 {
        self.published.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u32 {
        self.capacity - self.published()
    }

    /// Whether appends may still arrive. A non-appendable tail is final.
    pub fn appendable(&self) -> bool {
        !self.frozen.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// All published bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.published() as usize]
    }

    /// Published bytes from `at` onward, or None when `at` is past the tail.
    pub fn bytes_at(&self, at: u32) -> Option<&[u8]> {
        let published = self.published();
        if at > published {
            return None;
        }
        Some(&self.map[at as usize..published as usize])
    }

    /// Append `buf`, publish it, and return its position.
    pub fn append(&self, buf: &[u8]) -> Result<u32> {
        let at = self.published();
        let length = buf.len() as u32;
        if length > self.capacity - at {
            return Err(Error::Capacity {
                capacity: self.capacity,
                length,
                at,
            });
        }
        self.file.write_all_at(buf, at as u64)?;
        self.published.store(at + length, Ordering::Release);
        Ok(at)
    }

    /// Rewrite already-published bytes in place. Used only while re-ordering
    /// a file at freeze time, when no probe can be in flight.
    pub(crate) fn overwrite(&self, at: u32, buf: &[u8]) -> Result<()> {
        debug_assert!(at + buf.len() as u32 <= self.published());
        self.file.write_all_at(buf, at as u64)?;
        Ok(())
    }

    pub(crate) fn delete(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = CacheFile::create(dir.path().join("00000000.log"), 64).unwrap();

        assert_eq!(file.published(), 0);
        assert!(file.appendable());

        assert_eq!(file.append(b"alpha").unwrap(), 0);
        assert_eq!(file.append(b"beta").unwrap(), 5);
        assert_eq!(file.published(), 9);
        assert_eq!(file.bytes(), b"alphabeta");
        assert_eq!(file.bytes_at(5).unwrap(), b"beta");
        assert!(file.bytes_at(10).is_none());
    }

    #[test]
    fn rejects_append_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let file = CacheFile::create(dir.path().join("00000000.log"), 8).unwrap();

        file.append(b"12345678").unwrap();
        match file.append(b"x") {
            Err(Error::Capacity { capacity: 8, length: 1, at: 8 }) => (),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn freeze_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let file = CacheFile::create(dir.path().join("00000000.index"), 16).unwrap();
        assert!(file.appendable());
        file.freeze();
        assert!(!file.appendable());
    }
}
