use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::condition::Condition;
use crate::index::{Probe, POSITION_UNSET};
use crate::partition::{Partition, SegmentNode};
use crate::record::{EntryRef, Record, NO_ANCESTOR};
use crate::segment::{Segment, SegmentRef};
use crate::{DeltaType, Result};

/// A stateful reader of one partition under a filter condition and a
/// delta mode.
///
/// The cursor walks the segment chain, holding at most one segment
/// reference at a time, and yields records in strictly increasing offset
/// order. `next` returning `None` means "nothing deliverable right now":
/// either the appendable tail was reached (poll again later) or the chain
/// is exhausted.
pub struct Cursor {
    node: SegmentNode,
    segment: Option<SegmentRef>,
    offset: i64,
    latest_offset: i64,
    probe: Probe,
    condition: Condition,
    delta_type: DeltaType,
    delta_key_offsets: HashSet<i64>,
}

impl Cursor {
    pub fn new(
        partition: &Arc<Partition>,
        condition: Condition,
        delta_type: DeltaType,
        offset: i64,
        latest_offset: i64,
    ) -> Self {
        Self {
            node: partition.node_at(offset),
            segment: None,
            offset,
            latest_offset,
            probe: Probe::pack(0, 0),
            condition,
            delta_type,
            delta_key_offsets: HashSet::new(),
        }
    }

    /// The next offset this cursor will deliver at or after.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn latest_offset(&self) -> i64 {
        self.latest_offset
    }

    pub fn set_latest_offset(&mut self, latest_offset: i64) {
        self.latest_offset = latest_offset;
    }

    /// Produce the next deliverable record, or `None` when the appendable
    /// tail or the end of the chain is reached.
    pub fn next(&mut self) -> Result<Option<Record>> {
        if self.segment.is_none() && self.node.is_sentinel() {
            // The chain may have grown since we last ran off its end.
            self.node = self.node.partition().node_at(self.offset);
        }
        loop {
            if self.segment.is_none() && !self.acquire_forward() {
                return Ok(None);
            }
            let segment = self.segment.as_ref().unwrap();

            let candidate = self.condition.next(segment, self.probe);
            if candidate.is_retry() {
                return Ok(None);
            }
            if candidate.is_next_segment() {
                self.segment = None;
                self.node = self.node.advance();
                continue;
            }

            let entry = segment.entry_at(candidate.value())?;
            if entry.offset < self.offset || !self.condition.test(&entry) {
                self.offset = self.offset.max(entry.offset);
                self.probe = candidate.next_index().next_value();
                continue;
            }

            let record = materialize(
                &mut self.delta_key_offsets,
                self.delta_type,
                self.latest_offset,
                segment,
                &entry,
            )?;
            self.probe = candidate;
            return Ok(Some(record));
        }
    }

    /// Acquire the segment at the current node, skipping nodes whose
    /// segment was retired underneath us. On success the condition is
    /// rebound to the acquired segment.
    fn acquire_forward(&mut self) -> bool {
        loop {
            if self.node.is_sentinel() {
                return false;
            }
            match self.node.acquire() {
                Some(segment) => {
                    let probe = self.condition.reset(
                        &segment,
                        self.offset,
                        self.latest_offset,
                        POSITION_UNSET,
                    );
                    self.probe = if probe.is_sentinel() {
                        Probe::pack(0, 0)
                    } else {
                        probe
                    };
                    self.segment = Some(segment);
                    return true;
                }
                None => self.node = self.node.advance(),
            }
        }
    }

    /// Monotonic fast-forward to `new_offset`, re-seeking the chain when
    /// the target lies outside the held segment.
    pub fn advance(&mut self, new_offset: i64) {
        if new_offset <= self.offset {
            return;
        }
        self.offset = new_offset;

        let target = self.node.partition().node_at(new_offset);
        let held = self
            .segment
            .as_ref()
            .map(|segment| segment.base_offset() == target.base());
        if held != Some(true) {
            self.segment = None;
            self.node = target;
        }
    }

    /// Release the held segment reference. Idempotent.
    pub fn close(&mut self) {
        self.segment = None;
    }
}

/// Build the delivered record, applying delta-mode bookkeeping.
///
/// `delta_key_offsets` is the client's horizon: the offsets whose values
/// the client has seen during this traversal and may patch against. An
/// ancestor outside the horizon is cleared so the client never chases a
/// version it skipped; a tombstone retracts its ancestor and travels
/// verbatim.
fn materialize(
    delta_key_offsets: &mut HashSet<i64>,
    delta_type: DeltaType,
    latest_offset: i64,
    segment: &Segment,
    entry: &EntryRef<'_>,
) -> Result<Record> {
    let mut record = entry.to_record();

    if delta_type == DeltaType::None || entry.offset > latest_offset {
        return Ok(record);
    }

    if entry.is_tombstone() {
        if entry.ancestor != NO_ANCESTOR {
            delta_key_offsets.remove(&entry.ancestor);
        }
        return Ok(record);
    }

    if entry.ancestor != NO_ANCESTOR {
        if entry.delta_position >= 0 && delta_key_offsets.remove(&entry.ancestor) {
            let delta = segment.delta_at(entry.delta_position)?;
            record.value = Some(Bytes::copy_from_slice(delta));
            record.value_is_delta = true;
        } else {
            record.ancestor = NO_ANCESTOR;
        }
    }
    delta_key_offsets.insert(entry.offset);

    Ok(record)
}
