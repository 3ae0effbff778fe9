use bytes::Bytes;

use crate::filter::SequenceMatch;
use crate::index::{self, Probe, NEXT_SEGMENT, POSITION_UNSET, RETRY_SEGMENT};
use crate::record::{self, EntryRef};
use crate::segment::Segment;

/// A compiled filter predicate over one partition.
///
/// Every node answers three questions against the current segment:
/// `reset` - where does probing start for a given offset; `next` - where
/// is the next candidate at or beyond a probe; `test` - does a
/// materialized entry actually match. Probing is driven by the segment's
/// indexes and may answer RETRY_SEGMENT (appendable tail reached) or
/// NEXT_SEGMENT (segment exhausted); `test` is always byte-exact, which
/// keeps hash collisions harmless.
#[derive(Debug)]
pub enum Condition {
    /// No predicate: walk the offset index.
    None,
    Key(Equals),
    Header(Equals),
    HeaderSequence(HeaderSequence),
    Not(Box<Not>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn reset(
        &mut self,
        segment: &Segment,
        offset: i64,
        latest_offset: i64,
        position: i32,
    ) -> Probe {
        match self {
            Condition::None => offset_first(segment, offset),
            Condition::Key(equals) | Condition::Header(equals) => {
                equals.reset(segment, offset, position)
            }
            Condition::HeaderSequence(sequence) => {
                sequence.seek.reset(segment, offset, latest_offset, position)
            }
            Condition::Not(not) => not.reset(segment, offset, latest_offset, position),
            Condition::And(children) => {
                // Every child resets, even when the outcome is already
                // decided: nested anchors must all bind to this segment.
                let mut min = NEXT_SEGMENT;
                let mut next_segment = false;
                let mut retry = false;
                for child in children.iter_mut() {
                    let probe = child.reset(segment, offset, latest_offset, position);
                    next_segment |= probe.is_next_segment();
                    retry |= probe.is_retry();
                    min = index::min_by_value(min, probe);
                }
                if next_segment {
                    NEXT_SEGMENT
                } else if retry {
                    RETRY_SEGMENT
                } else {
                    min
                }
            }
            Condition::Or(children) => {
                let mut min = NEXT_SEGMENT;
                let mut retry = false;
                for child in children.iter_mut() {
                    let probe = child.reset(segment, offset, latest_offset, position);
                    retry |= probe.is_retry();
                    min = index::min_by_value(min, probe);
                }
                or_outcome(min, retry)
            }
        }
    }

    pub fn next(&mut self, segment: &Segment, probe: Probe) -> Probe {
        match self {
            Condition::None => segment.index().resolve(probe),
            Condition::Key(equals) | Condition::Header(equals) => {
                segment.hash().ceiling(equals.hash, probe)
            }
            Condition::HeaderSequence(sequence) => sequence.seek.next(segment, probe),
            Condition::Not(not) => not.next(segment, probe),
            Condition::And(children) => {
                let mut bound = probe;
                loop {
                    let mut min = NEXT_SEGMENT;
                    let mut max = NEXT_SEGMENT;
                    for child in children.iter_mut() {
                        let candidate = child.next(segment, bound);
                        if candidate.is_sentinel() {
                            return candidate;
                        }
                        min = index::min_by_value(min, candidate);
                        max = index::max_by_value(max, candidate);
                    }
                    if min.value() == max.value() {
                        // All children agree: a conjunction candidate.
                        return min;
                    }
                    bound = Probe::pack(0, max.value());
                }
            }
            Condition::Or(children) => {
                let mut min = NEXT_SEGMENT;
                let mut retry = false;
                for child in children.iter_mut() {
                    let candidate = child.next(segment, probe);
                    retry |= candidate.is_retry();
                    min = index::min_by_value(min, candidate);
                }
                or_outcome(min, retry)
            }
        }
    }

    pub fn test(&self, entry: &EntryRef<'_>) -> bool {
        match self {
            Condition::None => true,
            Condition::Key(equals) | Condition::Header(equals) => equals.test(entry),
            Condition::HeaderSequence(sequence) => sequence.test(entry),
            Condition::Not(not) => not.test(entry),
            Condition::And(children) => children.iter().all(|child| child.test(entry)),
            Condition::Or(children) => children.iter().any(|child| child.test(entry)),
        }
    }
}

/// A disjunction's merge outcome: the smallest real candidate wins; with
/// none, retry if any branch might still publish one.
fn or_outcome(min: Probe, retry: bool) -> Probe {
    if !min.is_sentinel() {
        min
    } else if retry {
        RETRY_SEGMENT
    } else {
        NEXT_SEGMENT
    }
}

/// First offset-index slot at or beyond `offset`.
fn offset_first(segment: &Segment, offset: i64) -> Probe {
    let delta = (offset - segment.base_offset()).max(0);
    segment.index().first(delta as u32)
}

/// Key- or header-equality, seeking through the hash index by CRC32C of
/// the stored comparable and testing byte-for-byte.
#[derive(Debug, Clone)]
pub struct Equals {
    hash: u32,
    kind: EqualsKind,
}

#[derive(Debug, Clone)]
enum EqualsKind {
    Key(Option<Bytes>),
    Header { name: Bytes, value: Bytes },
}

impl Equals {
    pub fn key(value: Option<Bytes>) -> Self {
        Self {
            hash: record::hash_key(value.as_deref()),
            kind: EqualsKind::Key(value),
        }
    }

    pub fn header(name: Bytes, value: Bytes) -> Self {
        Self {
            hash: record::hash_header(&name, &value),
            kind: EqualsKind::Header { name, value },
        }
    }

    fn reset(&self, segment: &Segment, offset: i64, position: i32) -> Probe {
        let min_position = if position != POSITION_UNSET {
            position
        } else {
            // The offset index bounds the log position a match may start at.
            let probe = offset_first(segment, offset);
            if probe.is_sentinel() {
                return probe;
            }
            probe.value()
        };
        segment.hash().ceiling(self.hash, Probe::pack(0, min_position))
    }

    fn test(&self, entry: &EntryRef<'_>) -> bool {
        match &self.kind {
            EqualsKind::Key(value) => entry.key() == value.as_deref(),
            EqualsKind::Header { name, value } => entry
                .headers()
                .any(|(n, v)| n == &name[..] && v == &value[..]),
        }
    }
}

/// Negation: a full scan of the offset index, with the nested condition's
/// own probe carried as an exclusion anchor. An entry short of the anchor
/// cannot be a nested match; an entry at the anchor is excluded exactly
/// when the nested byte test confirms it.
#[derive(Debug)]
pub struct Not {
    nested: Condition,
    anchor: Probe,
}

impl Not {
    pub fn new(nested: Condition) -> Self {
        Self {
            nested,
            anchor: RETRY_SEGMENT,
        }
    }

    fn reset(
        &mut self,
        segment: &Segment,
        offset: i64,
        latest_offset: i64,
        position: i32,
    ) -> Probe {
        self.anchor = self.nested.reset(segment, offset, latest_offset, position);
        offset_first(segment, offset)
    }

    fn next(&mut self, segment: &Segment, probe: Probe) -> Probe {
        let main = segment.index().resolve(probe);
        if let Some(value) = probe_position(main) {
            self.advance_anchor(segment, value);
        }
        main
    }

    /// Keep the anchor at the nested condition's first candidate at or
    /// beyond the main scan. A RETRY anchor is re-probed on the next call;
    /// a NEXT anchor is terminal for this segment.
    fn advance_anchor(&mut self, segment: &Segment, main_value: i32) {
        loop {
            match probe_position(self.anchor) {
                Some(anchor) if anchor >= main_value => return,
                Some(_) => {
                    let bound = self.anchor.next_index().next_value();
                    self.anchor = self.nested.next(segment, bound);
                }
                None if self.anchor.is_next_segment() => return,
                None => {
                    self.anchor = self.nested.next(segment, Probe::pack(0, main_value));
                    if self.anchor.is_retry() {
                        return;
                    }
                }
            }
        }
    }

    fn test(&self, entry: &EntryRef<'_>) -> bool {
        match probe_position(self.anchor) {
            Some(anchor) => !self.nested.test(entry) || (entry.position as i32) < anchor,
            // No nested candidate in sight: nothing to exclude.
            None => true,
        }
    }
}

fn probe_position(probe: Probe) -> Option<i32> {
    if probe.is_sentinel() {
        None
    } else {
        Some(probe.value())
    }
}

/// An ordered template over the headers of one name: required values in
/// order, with skips standing for any run of other same-name headers.
/// Index seeking degenerates to the conjunction of the required values;
/// ordering is enforced by the byte test alone.
#[derive(Debug)]
pub struct HeaderSequence {
    name: Bytes,
    template: Vec<SequenceMatch>,
    seek: Box<Condition>,
}

impl HeaderSequence {
    pub fn new(name: Bytes, template: Vec<SequenceMatch>) -> Self {
        let required: Vec<Condition> = template
            .iter()
            .filter_map(|step| match step {
                SequenceMatch::Value(value) => Some(Condition::Header(Equals::header(
                    name.clone(),
                    value.clone(),
                ))),
                SequenceMatch::Skip => None,
            })
            .collect();
        let seek = match required.len() {
            0 => Condition::None,
            1 => {
                let mut required = required;
                required.pop().unwrap()
            }
            _ => Condition::And(required),
        };
        Self {
            name,
            template,
            seek: Box::new(seek),
        }
    }

    fn test(&self, entry: &EntryRef<'_>) -> bool {
        let mut headers = entry
            .headers()
            .filter(|(name, _)| *name == &self.name[..])
            .map(|(_, value)| value);

        let mut at = 0;
        while at < self.template.len() {
            match &self.template[at] {
                SequenceMatch::Value(required) => match headers.next() {
                    Some(value) if value == &required[..] => at += 1,
                    _ => return false,
                },
                SequenceMatch::Skip => {
                    // A run of skips collapses onto the next required value.
                    let next = self.template[at..]
                        .iter()
                        .position(|step| matches!(step, SequenceMatch::Value(_)));
                    let Some(step) = next else {
                        // Trailing skip: the remainder is free.
                        return true;
                    };
                    let SequenceMatch::Value(required) = &self.template[at + step] else {
                        unreachable!()
                    };
                    loop {
                        match headers.next() {
                            Some(value) if value == &required[..] => break,
                            Some(_) => continue,
                            None => return false,
                        }
                    }
                    at += step + 1;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{self, Filter, FilterCondition};
    use crate::partition::{AppendRecord, Partition, PartitionAppender, SegmentConfig};
    use std::sync::Arc;

    fn partition() -> (tempfile::TempDir, Arc<Partition>) {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::create(
            dir.path().join("p0"),
            0,
            SegmentConfig {
                segment_bytes: 1 << 16,
                index_bytes: 1 << 12,
            },
        )
        .unwrap();
        (dir, partition)
    }

    fn append(
        appender: &mut PartitionAppender,
        key: Option<&[u8]>,
        headers: &[(&[u8], &[u8])],
        value: &[u8],
    ) -> i64 {
        appender
            .append(AppendRecord {
                timestamp: 0,
                key,
                headers,
                value: Some(value),
                ..Default::default()
            })
            .unwrap()
    }

    fn key_filter(value: &[u8]) -> FilterCondition {
        FilterCondition::Key {
            value: Some(Bytes::copy_from_slice(value)),
        }
    }

    fn header_filter(name: &[u8], value: &[u8]) -> FilterCondition {
        FilterCondition::Header {
            name: Bytes::copy_from_slice(name),
            value: Bytes::copy_from_slice(value),
        }
    }

    fn compile_one(condition: FilterCondition) -> Condition {
        filter::compile(&[Filter {
            conditions: vec![condition],
        }])
        .unwrap()
    }

    /// Drive the condition over the whole (single-segment) partition,
    /// collecting matching offsets the way a cursor would.
    fn matches(partition: &Arc<Partition>, mut condition: Condition) -> Vec<i64> {
        let node = partition.node_at(0);
        let segment = node.acquire().unwrap();

        let mut matched = Vec::new();
        let mut probe = condition.reset(&segment, 0, i64::MAX, POSITION_UNSET);
        if probe.is_sentinel() {
            return matched;
        }
        loop {
            let candidate = condition.next(&segment, probe);
            if candidate.is_sentinel() {
                return matched;
            }
            let entry = segment.entry_at(candidate.value()).unwrap();
            if condition.test(&entry) {
                matched.push(entry.offset);
            }
            probe = candidate.next_index().next_value();
        }
    }

    fn seed(appender: &mut PartitionAppender) {
        append(appender, Some(b"a"), &[(b"x", b"1")], b"A1"); // 0
        append(appender, Some(b"b"), &[(b"x", b"2")], b"B1"); // 1
        append(appender, Some(b"a"), &[(b"x", b"2")], b"A2"); // 2
        append(appender, None, &[(b"x", b"1")], b"N1"); // 3
        append(appender, Some(b"c"), &[], b"C1"); // 4
    }

    #[test]
    fn key_condition_matches_exact_key() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let condition = compile_one(key_filter(b"a"));
        assert_eq!(matches(&partition, condition), vec![0, 2]);
    }

    #[test]
    fn null_key_condition_matches_null_keys_only() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let condition = compile_one(FilterCondition::Key { value: None });
        assert_eq!(matches(&partition, condition), vec![3]);
    }

    #[test]
    fn header_condition_matches_name_and_value() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let condition = compile_one(header_filter(b"x", b"1"));
        assert_eq!(matches(&partition, condition), vec![0, 3]);
    }

    #[test]
    fn and_joins_key_with_header() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let condition = filter::compile(&[Filter {
            conditions: vec![key_filter(b"a"), header_filter(b"x", b"1")],
        }])
        .unwrap();
        assert_eq!(matches(&partition, condition), vec![0]);
    }

    #[test]
    fn or_merges_disjuncts_in_offset_order() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let condition = filter::compile(&[
            Filter {
                conditions: vec![key_filter(b"c")],
            },
            Filter {
                conditions: vec![header_filter(b"x", b"2")],
            },
        ])
        .unwrap();
        assert_eq!(matches(&partition, condition), vec![1, 2, 4]);
    }

    #[test]
    fn not_excludes_nested_matches() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let condition = compile_one(FilterCondition::Not(Box::new(key_filter(b"a"))));
        assert_eq!(matches(&partition, condition), vec![1, 3, 4]);
    }

    #[test]
    fn not_anchor_tracks_interleaved_hash_rows() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        // The shared header interleaves foreign rows into the hash file
        // between the nested condition's key rows.
        append(&mut appender, Some(b"a"), &[(b"x", b"1")], b"A");
        append(&mut appender, Some(b"b"), &[(b"x", b"1")], b"B");

        let condition = compile_one(FilterCondition::Not(Box::new(key_filter(b"b"))));
        assert_eq!(matches(&partition, condition), vec![0]);
    }

    #[test]
    fn conditions_probe_frozen_segments_too() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        seed(&mut appender);

        let node = partition.node_at(0);
        node.acquire().unwrap().freeze().unwrap();

        let condition = compile_one(header_filter(b"x", b"2"));
        assert_eq!(matches(&partition, condition), vec![1, 2]);
    }

    fn sequence(steps: Vec<SequenceMatch>) -> Condition {
        compile_one(FilterCondition::Headers {
            name: Bytes::from_static(b"h"),
            sequence: steps,
        })
    }

    fn value(v: &'static [u8]) -> SequenceMatch {
        SequenceMatch::Value(Bytes::from_static(v))
    }

    #[test]
    fn header_sequence_requires_order() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        append(&mut appender, None, &[(b"h", b"1"), (b"h", b"2")], b"ok"); // 0
        append(&mut appender, None, &[(b"h", b"2"), (b"h", b"1")], b"no"); // 1

        let condition = sequence(vec![value(b"1"), value(b"2")]);
        assert_eq!(matches(&partition, condition), vec![0]);
    }

    #[test]
    fn header_sequence_skip_spans_other_values() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        // v1 .. v2 with a gap of other h-headers.
        append(
            &mut appender,
            None,
            &[(b"h", b"1"), (b"h", b"9"), (b"h", b"2")],
            b"ok",
        ); // 0
        // v1 immediately followed by v2: the skip spans zero headers.
        append(&mut appender, None, &[(b"h", b"1"), (b"h", b"2")], b"ok"); // 1
        // v2 before v1: out of order.
        append(&mut appender, None, &[(b"h", b"2"), (b"h", b"1")], b"no"); // 2
        // Other header names are invisible to the template.
        append(
            &mut appender,
            None,
            &[(b"h", b"1"), (b"g", b"9"), (b"h", b"2")],
            b"ok",
        ); // 3

        let condition = sequence(vec![value(b"1"), SequenceMatch::Skip, value(b"2")]);
        assert_eq!(matches(&partition, condition), vec![0, 1, 3]);
    }

    #[test]
    fn header_sequence_is_anchored_at_the_first_header() {
        let (_dir, partition) = partition();
        let mut appender = PartitionAppender::new(&partition);
        append(&mut appender, None, &[(b"h", b"0"), (b"h", b"1")], b"no"); // 0
        append(&mut appender, None, &[(b"h", b"1"), (b"h", b"3")], b"ok"); // 1

        let condition = sequence(vec![value(b"1"), SequenceMatch::Skip]);
        assert_eq!(matches(&partition, condition), vec![1]);
    }
}
