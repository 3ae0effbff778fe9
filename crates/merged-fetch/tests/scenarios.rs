//! End-to-end subscriptions: client BEGIN through cache files on disk and
//! back, covering fan-out bring-up, filtering, delta transport, flow
//! control and leadership churn.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use merged_fetch::frame::{
    BeginEx, DataEx, DeltaType, Filter, FilterCondition, Frame, Half, MergedBeginEx, MergedDataEx,
    Message, PartitionOffset, SequenceMatch, DEFAULT_PARTITION_ID, ERROR_INVALID_REQUEST,
    ERROR_UNKNOWN_TOPIC_OR_PARTITION, OFFSET_EARLIEST,
};
use merged_fetch::{ClusterView, Fabric, GatewayConfig, MergedRoute};
use topic_cache::partition::{AppendRecord, PartitionAppender, SegmentConfig};
use topic_cache::topic::{Topic, TopicCache};

struct Gateway {
    _dir: tempfile::TempDir,
    fabric: Fabric,
    cache: Arc<TopicCache>,
    cluster: Arc<ClusterView>,
    merged_route: i64,
}

fn gateway() -> Gateway {
    gateway_with(GatewayConfig::default(), &[1])
}

fn gateway_with(config: GatewayConfig, brokers: &[i32]) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(TopicCache::new(
        dir.path().to_owned(),
        SegmentConfig {
            segment_bytes: 1 << 16,
            index_bytes: 1 << 12,
        },
    ));
    let cluster = ClusterView::new();

    let mut fabric = Fabric::new(config);
    let mut broker_routes = HashMap::new();
    for &broker in brokers {
        let route = fabric.add_cache_server(broker, cache.clone(), cluster.clone());
        broker_routes.insert(broker, route);
    }
    let bootstrap_route_id = broker_routes[&brokers[0]];
    let merged_route = fabric.add_merged_server(MergedRoute {
        bootstrap_route_id,
        broker_routes,
    });

    Gateway {
        _dir: dir,
        fabric,
        cache,
        cluster,
        merged_route,
    }
}

impl Gateway {
    fn topic(&self, name: &str, partitions: i32) -> Arc<Topic> {
        self.cache.topic_or_create(name, partitions).unwrap()
    }

    fn appender(&self, name: &str, partition: i32) -> PartitionAppender {
        let topic = self.cache.topic(name).unwrap();
        PartitionAppender::new(&topic.partition(partition).unwrap())
    }

    fn subscribe(&mut self, ex: MergedBeginEx) -> u64 {
        self.fabric.open(self.merged_route, BeginEx::Merged(ex))
    }
}

fn subscribe_all(topic: &str) -> MergedBeginEx {
    MergedBeginEx {
        topic: topic.to_string(),
        partitions: vec![PartitionOffset {
            partition_id: DEFAULT_PARTITION_ID,
            partition_offset: OFFSET_EARLIEST,
        }],
        filters: vec![],
        delta_type: DeltaType::None,
    }
}

fn put(appender: &mut PartitionAppender, key: &str, value: &str) -> i64 {
    appender
        .append(AppendRecord {
            timestamp: 0,
            key: Some(key.as_bytes()),
            value: Some(value.as_bytes()),
            ..Default::default()
        })
        .unwrap()
}

fn put_with_headers(
    appender: &mut PartitionAppender,
    key: &str,
    headers: &[(&str, &str)],
    value: &str,
) -> i64 {
    let headers: Vec<(&[u8], &[u8])> = headers
        .iter()
        .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
        .collect();
    appender
        .append(AppendRecord {
            timestamp: 0,
            key: Some(key.as_bytes()),
            headers: &headers,
            value: Some(value.as_bytes()),
            ..Default::default()
        })
        .unwrap()
}

/// Everything a client collects from a merged subscription, with the
/// credit ledger that backs the never-overdrawn assertion.
#[derive(Default)]
struct Collected {
    opened: Option<MergedBeginEx>,
    records: Vec<(MergedDataEx, Option<Bytes>)>,
    initial_reset: Option<Option<i32>>,
    reply_end: usize,
    reply_abort: usize,
    credited: i64,
    reserved: i64,
}

impl Collected {
    fn absorb(&mut self, messages: Vec<Message>) {
        for message in messages {
            match (message.half, message.frame) {
                (Half::Reply, Frame::Begin { extension: BeginEx::Merged(ex) }) => {
                    self.opened = Some(ex)
                }
                (Half::Reply, Frame::Data {
                    reserved,
                    payload,
                    extension: DataEx::Merged(ex),
                    ..
                }) => {
                    self.reserved += reserved;
                    self.records.push((ex, payload));
                }
                (Half::Reply, Frame::End) => self.reply_end += 1,
                (Half::Reply, Frame::Abort) => self.reply_abort += 1,
                (Half::Initial, Frame::Reset { error }) => self.initial_reset = Some(error),
                other => panic!("client received unexpected frame: {other:?}"),
            }
        }
    }

    fn offsets(&self) -> Vec<(i32, i64)> {
        self.records
            .iter()
            .map(|(ex, _)| (ex.partition.partition_id, ex.partition.partition_offset))
            .collect()
    }

    /// Per-partition offsets strictly increase, and every record's
    /// progress vector reflects exactly the records delivered so far.
    fn check_merge_invariants(&self) {
        let opened = self.opened.as_ref().expect("reply opened");
        let mut model: BTreeMap<i32, i64> = opened
            .partitions
            .iter()
            .map(|po| (po.partition_id, po.partition_offset))
            .collect();

        for (ex, _) in &self.records {
            let expected = model
                .get(&ex.partition.partition_id)
                .copied()
                .expect("record for an announced partition");
            assert!(
                ex.partition.partition_offset >= expected,
                "partition {} went backwards",
                ex.partition.partition_id
            );
            model.insert(ex.partition.partition_id, ex.partition.partition_offset + 1);

            let progress: BTreeMap<i32, i64> = ex
                .progress
                .iter()
                .map(|po| (po.partition_id, po.partition_offset))
                .collect();
            assert_eq!(progress, model, "progress vector diverged from delivery");
        }
        assert!(
            self.reserved <= self.credited,
            "reply reserved {} exceeds credit {}",
            self.reserved,
            self.credited
        );
    }
}

/// Subscribe-and-drain driver: grants `credit` per round, absorbing what
/// arrives, the way a live client replenishes its window.
fn pump(gateway: &mut Gateway, stream_id: u64, rounds: usize, credit: i64) -> Collected {
    let mut collected = Collected::default();
    collected.absorb(gateway.fabric.drain(stream_id));
    for _ in 0..rounds {
        if collected.opened.is_none() || collected.initial_reset.is_some() {
            break;
        }
        gateway.fabric.reply_window(stream_id, 1, credit, 0);
        collected.credited += credit;
        collected.absorb(gateway.fabric.drain(stream_id));
    }
    collected
}

#[test]
fn subscription_from_earliest_delivers_every_partition_in_offset_order() {
    let mut gateway = gateway();
    gateway.topic("t", 3);

    // Arrival order across partitions: (0,0) (1,0) (0,1) (2,0).
    let mut p0 = gateway.appender("t", 0);
    let mut p1 = gateway.appender("t", 1);
    let mut p2 = gateway.appender("t", 2);
    put(&mut p0, "a", "A1");
    put(&mut p1, "b", "B1");
    put(&mut p0, "a", "A2");
    put(&mut p2, "c", "C1");

    let stream_id = gateway.subscribe(subscribe_all("t"));
    let collected = pump(&mut gateway, stream_id, 5, 4096);

    let opened = collected.opened.as_ref().expect("reply opened");
    let mut announced: Vec<(i32, i64)> = opened
        .partitions
        .iter()
        .map(|po| (po.partition_id, po.partition_offset))
        .collect();
    announced.sort();
    assert_eq!(announced, vec![(0, 0), (1, 0), (2, 0)]);

    let mut offsets = collected.offsets();
    collected.check_merge_invariants();

    // Within a partition order is fixed; across partitions it is not.
    let p0_offsets: Vec<i64> = offsets.iter().filter(|(p, _)| *p == 0).map(|(_, o)| *o).collect();
    assert_eq!(p0_offsets, vec![0, 1]);
    offsets.sort();
    assert_eq!(offsets, vec![(0, 0), (0, 1), (1, 0), (2, 0)]);

    let values: Vec<&[u8]> = collected
        .records
        .iter()
        .map(|(_, payload)| payload.as_deref().unwrap())
        .collect();
    assert!(values.contains(&&b"A1"[..]) && values.contains(&&b"C1"[..]));
}

#[test]
fn key_and_header_filters_conjoin() {
    let mut gateway = gateway();
    gateway.topic("t", 1);
    let mut p0 = gateway.appender("t", 0);
    put_with_headers(&mut p0, "a", &[("x", "1")], "v0");
    put_with_headers(&mut p0, "a", &[("x", "2")], "v1");
    put_with_headers(&mut p0, "b", &[("x", "1")], "v2");

    let mut ex = subscribe_all("t");
    ex.filters = vec![Filter {
        conditions: vec![
            FilterCondition::Key {
                value: Some(Bytes::from_static(b"a")),
            },
            FilterCondition::Header {
                name: Bytes::from_static(b"x"),
                value: Bytes::from_static(b"1"),
            },
        ],
    }];
    let stream_id = gateway.subscribe(ex);
    let collected = pump(&mut gateway, stream_id, 3, 4096);

    assert_eq!(collected.offsets(), vec![(0, 0)]);
    collected.check_merge_invariants();
}

#[test]
fn not_filter_excludes_the_matching_key() {
    let mut gateway = gateway();
    gateway.topic("t", 1);
    let mut p0 = gateway.appender("t", 0);
    put_with_headers(&mut p0, "a", &[("x", "1")], "v0");
    put_with_headers(&mut p0, "a", &[("x", "2")], "v1");
    put_with_headers(&mut p0, "b", &[("x", "1")], "v2");

    let mut ex = subscribe_all("t");
    ex.filters = vec![Filter {
        conditions: vec![FilterCondition::Not(Box::new(FilterCondition::Key {
            value: Some(Bytes::from_static(b"a")),
        }))],
    }];
    let stream_id = gateway.subscribe(ex);
    let collected = pump(&mut gateway, stream_id, 3, 4096);

    assert_eq!(collected.offsets(), vec![(0, 2)]);
    collected.check_merge_invariants();
}

/// Lay out a keyed lineage for the delta scenarios: versions of "k" at
/// offsets 5 and 9, with an encoded JSON patch between them.
fn seed_delta_topic(gateway: &mut Gateway) -> Vec<u8> {
    gateway.topic("t", 1);
    let mut p0 = gateway.appender("t", 0);

    let v1 = serde_json::json!({"n": 1});
    let v2 = serde_json::json!({"n": 2});
    let patch = serde_json::to_vec(&json_patch::diff(&v1, &v2)).unwrap();

    for i in 0..5 {
        put(&mut p0, &format!("f{i}"), "filler");
    }
    let at = p0
        .append(AppendRecord {
            timestamp: 0,
            key: Some(b"k"),
            value: Some(&serde_json::to_vec(&v1).unwrap()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(at, 5);
    for i in 6..9 {
        put(&mut p0, &format!("f{i}"), "filler");
    }
    let at = p0
        .append(AppendRecord {
            timestamp: 0,
            key: Some(b"k"),
            value: Some(&serde_json::to_vec(&v2).unwrap()),
            delta: Some(&patch),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(at, 9);
    patch
}

#[test]
fn json_patch_delta_replaces_the_value_when_the_ancestor_was_seen() {
    let mut gateway = gateway();
    let patch = seed_delta_topic(&mut gateway);

    let mut ex = subscribe_all("t");
    ex.delta_type = DeltaType::JsonPatch;
    let stream_id = gateway.subscribe(ex);
    let collected = pump(&mut gateway, stream_id, 3, 65536);
    collected.check_merge_invariants();

    let by_offset: HashMap<i64, &(MergedDataEx, Option<Bytes>)> = collected
        .records
        .iter()
        .map(|record| (record.0.partition.partition_offset, record))
        .collect();

    let (full, payload) = by_offset[&5];
    assert_eq!(full.delta.ancestor_offset, -1);
    assert_eq!(payload.as_deref(), Some(&br#"{"n":1}"#[..]));

    let (delta, payload) = by_offset[&9];
    assert_eq!(delta.delta.delta_type, DeltaType::JsonPatch);
    assert_eq!(delta.delta.ancestor_offset, 5);
    assert_eq!(payload.as_deref(), Some(&patch[..]));
}

#[test]
fn delta_collapses_to_full_value_outside_the_horizon() {
    let mut gateway = gateway();
    let _patch = seed_delta_topic(&mut gateway);

    let mut ex = subscribe_all("t");
    ex.partitions = vec![PartitionOffset {
        partition_id: 0,
        partition_offset: 8,
    }];
    ex.delta_type = DeltaType::JsonPatch;
    let stream_id = gateway.subscribe(ex);
    let collected = pump(&mut gateway, stream_id, 3, 65536);
    collected.check_merge_invariants();

    assert_eq!(collected.offsets(), vec![(0, 8), (0, 9)]);
    let (latest, payload) = &collected.records[1];
    // The client never saw offset 5, so the patch collapses.
    assert_eq!(latest.delta.ancestor_offset, -1);
    assert_eq!(latest.delta.delta_type, DeltaType::None);
    assert_eq!(payload.as_deref(), Some(&br#"{"n":2}"#[..]));
}

#[test]
fn leadership_move_resumes_at_retained_progress() {
    let mut gateway = gateway_with(GatewayConfig::default(), &[1, 2]);
    gateway.topic("t", 1);
    gateway.cluster.set_leaders("t", vec![1]);

    let mut p0 = gateway.appender("t", 0);
    for i in 0..5 {
        put(&mut p0, "k", &format!("v{i}"));
    }

    let stream_id = gateway.subscribe(subscribe_all("t"));
    let mut collected = pump(&mut gateway, stream_id, 2, 65536);
    assert_eq!(
        collected.offsets(),
        vec![(0, 0), (0, 1), (0, 2), (0, 3), (0, 4)]
    );

    // Leadership moves to broker 2; the old fetch resets with code 6 and
    // the next meta snapshot opens a successor at the retained offset.
    gateway.cluster.set_leaders("t", vec![2]);
    gateway.fabric.run();

    for i in 5..10 {
        put(&mut p0, "k", &format!("v{i}"));
    }
    gateway.fabric.reply_window(stream_id, 1, 65536, 0);
    collected.credited += 65536;
    collected.absorb(gateway.fabric.drain(stream_id));

    assert_eq!(
        collected.offsets(),
        (0..10).map(|o| (0, o)).collect::<Vec<_>>(),
        "the leadership seam lost or duplicated records"
    );
    collected.check_merge_invariants();
}

#[test]
fn resume_from_the_progress_vector_has_no_gap_and_no_duplicate() {
    let mut gateway = gateway();
    gateway.topic("t", 1);
    let mut p0 = gateway.appender("t", 0);
    for i in 0..5 {
        put(&mut p0, "k", &format!("w{i}"));
    }

    // First subscription: enough credit for exactly two 2-byte payloads.
    let first = gateway.subscribe(subscribe_all("t"));
    let collected = pump(&mut gateway, first, 1, 4);
    assert_eq!(collected.offsets(), vec![(0, 0), (0, 1)]);
    let resume = collected.records.last().unwrap().0.progress.clone();
    gateway.fabric.initial_abort(first);
    gateway.fabric.run();

    // Second subscription resumes from the reported progress.
    let mut ex = subscribe_all("t");
    ex.partitions = resume;
    let second = gateway.subscribe(ex);
    let collected = pump(&mut gateway, second, 2, 65536);
    assert_eq!(collected.offsets(), vec![(0, 2), (0, 3), (0, 4)]);
    collected.check_merge_invariants();
}

#[test]
fn double_negated_header_sequences_are_rejected() {
    let mut gateway = gateway();
    gateway.topic("t", 1);

    let mut ex = subscribe_all("t");
    ex.filters = vec![Filter {
        conditions: vec![FilterCondition::Not(Box::new(FilterCondition::Not(
            Box::new(FilterCondition::Headers {
                name: Bytes::from_static(b"h"),
                sequence: vec![SequenceMatch::Skip],
            }),
        )))],
    }];
    let stream_id = gateway.subscribe(ex);
    let collected = pump(&mut gateway, stream_id, 1, 4096);

    assert_eq!(collected.initial_reset, Some(Some(ERROR_INVALID_REQUEST)));
    assert!(collected.opened.is_none());
}

#[test]
fn unknown_topics_reset_when_bootstrap_is_disabled() {
    let config: GatewayConfig =
        serde_json::from_str(r#"{"topic.bootstrap.enabled": false}"#).unwrap();
    let mut gateway = gateway_with(config, &[1]);

    let stream_id = gateway.subscribe(subscribe_all("missing"));
    let collected = pump(&mut gateway, stream_id, 1, 4096);

    assert_eq!(
        collected.initial_reset,
        Some(Some(ERROR_UNKNOWN_TOPIC_OR_PARTITION))
    );
    assert!(collected.opened.is_none());
}

#[test]
fn bootstrap_creates_the_topic_and_opens_an_empty_reply() {
    let mut gateway = gateway();

    let stream_id = gateway.subscribe(subscribe_all("fresh"));
    let collected = pump(&mut gateway, stream_id, 2, 4096);

    let opened = collected.opened.expect("bootstrap opened the reply");
    assert_eq!(opened.partitions.len(), 1);
    assert_eq!(opened.partitions[0].partition_offset, 0);
    assert!(collected.records.is_empty());
    assert!(gateway.cache.topic("fresh").is_some());
}

#[test]
fn client_abort_cascades_to_a_single_reply_close() {
    let mut gateway = gateway();
    gateway.topic("t", 1);
    let mut p0 = gateway.appender("t", 0);
    put(&mut p0, "k", "v");

    let stream_id = gateway.subscribe(subscribe_all("t"));
    let mut collected = pump(&mut gateway, stream_id, 2, 4096);
    assert_eq!(collected.records.len(), 1);

    gateway.fabric.initial_abort(stream_id);
    collected.absorb(gateway.fabric.drain(stream_id));
    assert_eq!(collected.reply_abort, 1);
    assert_eq!(collected.reply_end, 0);

    // The fabric is quiet afterwards: no substream lingers.
    gateway.fabric.run();
    assert!(gateway.fabric.drain(stream_id).is_empty());
}
