use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::record::{self, NO_ANCESTOR, NO_DELTA};
use crate::segment::{Segment, SegmentRef};
use crate::{Error, Result};

pub use crate::segment::SegmentConfig;

const SENTINEL_BASE: i64 = i64::MAX;

/// An ordered chain of segments for one partition.
///
/// Navigation happens through [`SegmentNode`] markers rather than borrowed
/// iterators, so cursors can keep their place across appends, rolls and
/// retirement of the segments they are walking.
pub struct Partition {
    id: i32,
    dir: PathBuf,
    config: SegmentConfig,
    chain: RwLock<BTreeMap<i64, Arc<Segment>>>,
    next_offset: AtomicI64,
}

impl Partition {
    pub fn create(dir: PathBuf, id: i32, config: SegmentConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            id,
            dir,
            config,
            chain: RwLock::new(BTreeMap::new()),
            next_offset: AtomicI64::new(0),
        }))
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// The offset the next appended record will take.
    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// The earliest retained offset.
    pub fn earliest_offset(&self) -> i64 {
        let chain = self.chain.read().unwrap();
        match chain.keys().next() {
            Some(base) => *base,
            None => self.next_offset(),
        }
    }

    /// The node covering `offset`: the last segment starting at or before
    /// it, else the nearest forward segment, else the sentinel.
    pub fn node_at(self: &Arc<Self>, offset: i64) -> SegmentNode {
        let chain = self.chain.read().unwrap();
        let base = chain
            .range(..=offset)
            .next_back()
            .or_else(|| chain.range(offset..).next())
            .map(|(base, _)| *base)
            .unwrap_or(SENTINEL_BASE);
        SegmentNode {
            partition: self.clone(),
            base,
        }
    }

    pub fn sentinel(self: &Arc<Self>) -> SegmentNode {
        SegmentNode {
            partition: self.clone(),
            base: SENTINEL_BASE,
        }
    }

    fn segment(&self, base: i64) -> Option<Arc<Segment>> {
        self.chain.read().unwrap().get(&base).cloned()
    }

    fn head(&self) -> Option<Arc<Segment>> {
        self.chain.read().unwrap().values().next_back().cloned()
    }

    fn roll(&self, base: i64) -> Result<Arc<Segment>> {
        if let Some(head) = self.head() {
            head.freeze()?;
        }
        let segment = Segment::create(&self.dir, base, &self.config)?;
        self.chain.write().unwrap().insert(base, segment.clone());
        tracing::debug!(partition = self.id, base, "rolled segment");
        Ok(segment)
    }

    /// Retire every segment whose entire range lies below `offset`. Files
    /// are reclaimed as the last cursor reference to each segment drops.
    pub fn retire_through(&self, offset: i64) {
        let mut chain = self.chain.write().unwrap();
        loop {
            let mut bases = chain.keys();
            let (first, next) = match (bases.next(), bases.next()) {
                (Some(first), Some(next)) => (*first, *next),
                // The head segment is never retired here.
                _ => break,
            };
            if next > offset {
                break;
            }
            let segment = chain.remove(&first).unwrap();
            segment.retire();
            tracing::debug!(partition = self.id, base = first, "retired segment");
        }
    }
}

/// A cursor's place in the segment chain. The sentinel node marks the end
/// of the chain; it never resolves to a segment.
#[derive(Clone)]
pub struct SegmentNode {
    partition: Arc<Partition>,
    base: i64,
}

impl SegmentNode {
    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    pub(crate) fn base(&self) -> i64 {
        self.base
    }

    pub fn is_sentinel(&self) -> bool {
        self.base == SENTINEL_BASE
    }

    /// Acquire the node's segment, unless it is the sentinel or the
    /// segment was retired out from under us.
    pub fn acquire(&self) -> Option<SegmentRef> {
        if self.is_sentinel() {
            return None;
        }
        self.partition.segment(self.base)?.acquire()
    }

    /// The next node in the chain, or the sentinel past the tail.
    pub fn advance(&self) -> SegmentNode {
        let chain = self.partition.chain.read().unwrap();
        let base = chain
            .range((Bound::Excluded(self.base), Bound::Unbounded))
            .next()
            .map(|(base, _)| *base)
            .unwrap_or(SENTINEL_BASE);
        SegmentNode {
            partition: self.partition.clone(),
            base,
        }
    }
}

/// A record handed to the appender. `delta` is the encoded diff against
/// the prior version of the same key; it is stored only when that prior
/// version exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppendRecord<'a> {
    pub timestamp: i64,
    pub key: Option<&'a [u8]>,
    pub headers: &'a [(&'a [u8], &'a [u8])],
    pub value: Option<&'a [u8]>,
    pub delta: Option<&'a [u8]>,
}

/// The single writer of a partition.
///
/// Appends go log, delta, hash rows, and the offset-index row last: index
/// publication is the entry's visibility point, so readers never observe
/// an entry whose companion rows are missing. The appender stamps each
/// entry's ancestor from the live offset of its key and rolls to a fresh
/// segment when any file would overflow.
pub struct PartitionAppender {
    partition: Arc<Partition>,
    head: Option<Arc<Segment>>,
    next_offset: i64,
    live_keys: HashMap<Bytes, i64>,
    scratch: Vec<u8>,
}

impl PartitionAppender {
    pub fn new(partition: &Arc<Partition>) -> Self {
        let next_offset = partition.next_offset();
        Self {
            partition: partition.clone(),
            head: partition.head(),
            next_offset,
            live_keys: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    pub fn append(&mut self, record: AppendRecord<'_>) -> Result<i64> {
        let offset = self.next_offset;

        let ancestor = match record.key {
            Some(key) if record.value.is_none() => {
                self.live_keys.remove(key).unwrap_or(NO_ANCESTOR)
            }
            Some(key) => self.live_keys.get(key).copied().unwrap_or(NO_ANCESTOR),
            None => NO_ANCESTOR,
        };
        let delta = record.delta.filter(|_| ancestor != NO_ANCESTOR);

        self.scratch.clear();
        // Encoded once with a placeholder delta position to learn the
        // record's size for the roll decision; re-encoded below once the
        // delta position in the target segment is known.
        let length = record::encode(
            &mut self.scratch,
            offset,
            record.timestamp,
            ancestor,
            NO_DELTA,
            record.key,
            record.headers,
            record.value,
        );

        let hash_rows = 1 + record.headers.len() as u32;
        let delta_length = delta.map(|delta| 4 + delta.len() as u32).unwrap_or(0);
        let segment = self.segment_with_room(length as u32, delta_length, hash_rows, offset)?;

        let delta_position = match delta {
            Some(delta) => segment.append_delta(delta)?,
            None => NO_DELTA,
        };
        if delta_position != NO_DELTA {
            self.scratch.clear();
            record::encode(
                &mut self.scratch,
                offset,
                record.timestamp,
                ancestor,
                delta_position,
                record.key,
                record.headers,
                record.value,
            );
        }

        let position = segment.log().append(&self.scratch)? as i32;

        segment
            .hash()
            .append(record::hash_key(record.key), position)?;
        for (name, value) in record.headers {
            segment
                .hash()
                .append(record::hash_header(name, value), position)?;
        }
        segment
            .index()
            .append((offset - segment.base_offset()) as u32, position)?;

        if let (Some(key), Some(_)) = (record.key, record.value) {
            self.live_keys.insert(Bytes::copy_from_slice(key), offset);
        }

        self.next_offset = offset + 1;
        self.partition
            .next_offset
            .store(self.next_offset, Ordering::Release);
        Ok(offset)
    }

    fn segment_with_room(
        &mut self,
        log_length: u32,
        delta_length: u32,
        hash_rows: u32,
        base_if_rolled: i64,
    ) -> Result<Arc<Segment>> {
        if let Some(head) = self.head.as_ref() {
            if head.has_room(log_length, delta_length, hash_rows) {
                return Ok(head.clone());
            }
        }

        let rolled = self.partition.roll(base_if_rolled)?;
        if !rolled.has_room(log_length, delta_length, hash_rows) {
            return Err(Error::Oversized {
                length: log_length as usize,
            });
        }
        self.head = Some(rolled.clone());
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_partition() -> (tempfile::TempDir, Arc<Partition>) {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig {
            segment_bytes: 512,
            index_bytes: 128,
        };
        let partition = Partition::create(dir.path().join("p0"), 0, config).unwrap();
        (dir, partition)
    }

    fn put(appender: &mut PartitionAppender, key: &[u8], value: &[u8]) -> i64 {
        appender
            .append(AppendRecord {
                timestamp: 1,
                key: Some(key),
                value: Some(value),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn appends_assign_contiguous_offsets() {
        let (_dir, partition) = small_partition();
        let mut appender = PartitionAppender::new(&partition);

        assert_eq!(put(&mut appender, b"a", b"1"), 0);
        assert_eq!(put(&mut appender, b"b", b"2"), 1);
        assert_eq!(put(&mut appender, b"a", b"3"), 2);
        assert_eq!(partition.next_offset(), 3);
        assert_eq!(partition.earliest_offset(), 0);
    }

    #[test]
    fn ancestor_tracks_live_key_and_tombstone_clears_it() {
        let (_dir, partition) = small_partition();
        let mut appender = PartitionAppender::new(&partition);

        put(&mut appender, b"k", b"v1");
        put(&mut appender, b"k", b"v2");
        appender
            .append(AppendRecord {
                timestamp: 1,
                key: Some(b"k"),
                value: None,
                ..Default::default()
            })
            .unwrap();
        put(&mut appender, b"k", b"v3");

        let node = partition.node_at(0);
        let segment = node.acquire().unwrap();
        let ancestors: Vec<i64> = (0..4)
            .map(|slot| {
                let probe = segment.index().resolve(crate::index::Probe::pack(slot, 0));
                segment.entry_at(probe.value()).unwrap().ancestor
            })
            .collect();
        // v2 descends from v1; the tombstone names what it deletes; v3
        // starts a fresh lineage.
        assert_eq!(ancestors, vec![-1, 0, 1, -1]);
    }

    #[test]
    fn rolls_when_the_head_fills_and_nodes_walk_the_chain() {
        let (_dir, partition) = small_partition();
        let mut appender = PartitionAppender::new(&partition);

        let payload = [0u8; 96];
        for i in 0..12 {
            appender
                .append(AppendRecord {
                    timestamp: i,
                    key: Some(b"key"),
                    value: Some(&payload),
                    ..Default::default()
                })
                .unwrap();
        }

        let first = partition.node_at(0);
        assert!(!first.is_sentinel());
        let mut node = first.clone();
        let mut bases = vec![];
        while !node.is_sentinel() {
            bases.push(node.acquire().unwrap().base_offset());
            node = node.advance();
        }
        assert!(bases.len() > 1, "expected a roll, got {bases:?}");
        assert_eq!(bases.first(), Some(&0));

        // node_at lands on the covering segment.
        let last_base = *bases.last().unwrap();
        let covering = partition.node_at(last_base + 1);
        assert_eq!(covering.acquire().unwrap().base_offset(), last_base);
    }

    #[test]
    fn retire_through_reclaims_old_segments() {
        let (_dir, partition) = small_partition();
        let mut appender = PartitionAppender::new(&partition);

        let payload = [0u8; 96];
        for i in 0..12 {
            appender
                .append(AppendRecord {
                    timestamp: i,
                    key: None,
                    value: Some(&payload),
                    ..Default::default()
                })
                .unwrap();
        }

        let head_base = {
            let node = partition.node_at(partition.next_offset() - 1);
            node.acquire().unwrap().base_offset()
        };
        partition.retire_through(head_base);
        assert_eq!(partition.earliest_offset(), head_base);

        // Seeking an offset below retention lands on the earliest segment.
        let node = partition.node_at(0);
        assert_eq!(node.acquire().unwrap().base_offset(), head_base);
    }
}
