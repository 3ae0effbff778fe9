use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::file::CacheFile;
use crate::index::IndexFile;
use crate::record::EntryRef;
use crate::{Error, Result};

/// Sizing for a partition's segment files.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Capacity of the log and delta files.
    pub segment_bytes: u32,
    /// Capacity of the offset-index and hash-index files.
    pub index_bytes: u32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 128 << 20,
            index_bytes: 1 << 20,
        }
    }
}

const RETIRED: i64 = 1 << 62;

/// One append-only slice of a partition's log, with its offset index, hash
/// index, and delta file.
///
/// Segments are shared by cursors through a reference count that also
/// gates file deletion: a retired segment deletes its files when the last
/// reference drops, and cannot be acquired again.
pub struct Segment {
    base_offset: i64,
    log: CacheFile,
    index: IndexFile,
    hash: IndexFile,
    delta: CacheFile,
    state: AtomicI64,
}

impl Segment {
    pub fn create(dir: &Path, base_offset: i64, config: &SegmentConfig) -> Result<Arc<Self>> {
        let name = |suffix: &str| dir.join(format!("{base_offset:020}.{suffix}"));

        Ok(Arc::new(Self {
            base_offset,
            log: CacheFile::create(name("log"), config.segment_bytes)?,
            index: IndexFile::new(CacheFile::create(name("index"), config.index_bytes)?),
            hash: IndexFile::new(CacheFile::create(name("hash"), config.index_bytes)?),
            delta: CacheFile::create(name("delta"), config.segment_bytes)?,
            state: AtomicI64::new(0),
        }))
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn log(&self) -> &CacheFile {
        &self.log
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    pub fn hash(&self) -> &IndexFile {
        &self.hash
    }

    /// Parse the entry at a position previously read from an index row.
    pub fn entry_at(&self, position: i32) -> Result<EntryRef<'_>> {
        let position = position as u32;
        let buf = self
            .log
            .bytes_at(position)
            .ok_or(Error::Corrupt { position })?;
        EntryRef::parse(buf, position)
    }

    /// Append a delta payload, returning its position in the delta file.
    pub fn append_delta(&self, payload: &[u8]) -> Result<i32> {
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        Ok(self.delta.append(&buf)? as i32)
    }

    /// The delta payload at an entry's `delta_position`.
    pub fn delta_at(&self, position: i32) -> Result<&[u8]> {
        let position = position as u32;
        let corrupt = || Error::Corrupt { position };
        let buf = self.delta.bytes_at(position).ok_or_else(corrupt)?;
        let length =
            u32::from_le_bytes(buf.get(..4).ok_or_else(corrupt)?.try_into().unwrap()) as usize;
        buf.get(4..4 + length).ok_or_else(corrupt)
    }

    /// Whether one more record of these proportions fits this segment.
    pub fn has_room(&self, log_length: u32, delta_length: u32, hash_rows: u32) -> bool {
        self.log.available() >= log_length
            && self.delta.available() >= delta_length
            && self.index.available() >= 8
            && self.hash.available() >= hash_rows * 8
    }

    /// End the append lifetime: order the hash index for binary search and
    /// freeze every file.
    pub fn freeze(&self) -> Result<()> {
        self.log.freeze();
        self.delta.freeze();
        self.index.file().freeze();
        self.hash.freeze_sorted()
    }

    /// Take a reference, unless the segment has been retired.
    pub fn acquire(self: &Arc<Self>) -> Option<SegmentRef> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & RETIRED != 0 {
                    None
                } else {
                    Some(state + 1)
                }
            })
            .ok()?;
        Some(SegmentRef {
            segment: self.clone(),
        })
    }

    fn release(&self) {
        let state = self.state.fetch_sub(1, Ordering::AcqRel) - 1;
        if state == RETIRED {
            self.delete_files();
        }
    }

    /// Mark the segment for deletion; files go when the last reference does.
    pub fn retire(&self) {
        let state = self.state.fetch_or(RETIRED, Ordering::AcqRel);
        if state == 0 {
            self.delete_files();
        }
    }

    fn delete_files(&self) {
        for file in [&self.log, self.index.file(), self.hash.file(), &self.delta] {
            if let Err(error) = file.delete() {
                tracing::warn!(?error, path = ?file.path(), "failed to delete retired segment file");
            }
        }
        tracing::debug!(base_offset = self.base_offset, "deleted retired segment");
    }
}

/// A held segment reference; dropping it releases exactly once.
pub struct SegmentRef {
    segment: Arc<Segment>,
}

impl SegmentRef {
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl std::ops::Deref for SegmentRef {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        self.segment.release();
    }
}
