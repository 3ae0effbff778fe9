use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use topic_cache::cursor::Cursor;
use topic_cache::record::NO_ANCESTOR;
use topic_cache::topic::Topic;
use topic_cache::{filter, DeltaType, Record};

use crate::fabric::{CacheRoute, Engine};
use crate::frame::{
    BeginEx, DataEx, DeltaEx, DescribeBeginEx, DescribeDataEx, FetchBeginEx, FetchDataEx, Frame,
    Half, Message, MetaBeginEx, MetaDataEx, PartitionLeader, PartitionOffset, DEFAULT_PARTITION_ID,
    ERROR_INVALID_REQUEST, ERROR_NOT_LEADER_FOR_PARTITION, ERROR_UNKNOWN_TOPIC_OR_PARTITION,
    FLAGS_COMPLETE, OFFSET_EARLIEST, OFFSET_LATEST,
};
use crate::state;

/// The cluster's partition→leader table as this gateway currently sees
/// it. Meta streams snapshot it; fetch servers re-check it every poll so
/// a leadership move surfaces as NOT_LEADER_FOR_PARTITION.
pub struct ClusterView {
    inner: RwLock<ClusterState>,
}

struct ClusterState {
    leaders: HashMap<String, Vec<i32>>,
    version: u64,
}

impl ClusterView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(ClusterState {
                leaders: HashMap::new(),
                version: 1,
            }),
        })
    }

    pub fn set_leaders(&self, topic: &str, leaders: Vec<i32>) {
        let mut inner = self.inner.write().unwrap();
        inner.leaders.insert(topic.to_string(), leaders);
        inner.version += 1;
    }

    pub fn version(&self) -> u64 {
        self.inner.read().unwrap().version
    }

    pub fn leaders(&self, topic: &str) -> Option<Vec<i32>> {
        self.inner.read().unwrap().leaders.get(topic).cloned()
    }

    pub fn leader(&self, topic: &str, partition_id: i32) -> Option<i32> {
        self.inner
            .read()
            .unwrap()
            .leaders
            .get(topic)
            .and_then(|leaders| leaders.get(partition_id as usize))
            .copied()
    }
}

/// Serves one describe substream: the topic's config table, re-emitted
/// whenever its version advances. Presence of the reply is what tells the
/// coordinator the topic exists.
pub struct DescribeServer {
    stream_id: u64,
    route: CacheRoute,
    state: u32,
    topic: Option<Arc<Topic>>,
    configs: Vec<String>,
    emitted_version: u64,
    budget_id: u64,
}

impl DescribeServer {
    pub(crate) fn new(stream_id: u64, route: CacheRoute) -> Self {
        Self {
            stream_id,
            route,
            state: 0,
            topic: None,
            configs: Vec::new(),
            emitted_version: 0,
            budget_id: 0,
        }
    }

    pub(crate) fn on_message(&mut self, engine: &mut Engine, message: Message) {
        let Message {
            half,
            trace_id,
            frame,
            ..
        } = message;
        if self.closed() {
            return;
        }
        match (half, frame) {
            (Half::Initial, Frame::Begin { extension: BeginEx::Describe(ex) }) => {
                self.on_begin(engine, trace_id, ex)
            }
            (Half::Initial, Frame::End) => {
                engine.do_reply_end(self.stream_id, trace_id);
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Initial, Frame::Abort) => {
                engine.do_reply_abort(self.stream_id, trace_id);
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Reply, Frame::Window { budget_id, .. }) => {
                self.budget_id = budget_id;
                self.state = state::opened_reply(self.state);
            }
            (Half::Reply, Frame::Reset { .. }) => {
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (half, frame) => {
                tracing::debug!(?half, ?frame, "describe server ignoring frame");
            }
        }
    }

    fn on_begin(&mut self, engine: &mut Engine, trace_id: i64, ex: DescribeBeginEx) {
        let topic = resolve_topic(&self.route, engine, &ex.topic, 1);
        let Some(topic) = topic else {
            engine.do_initial_reset(
                self.stream_id,
                trace_id,
                Some(ERROR_UNKNOWN_TOPIC_OR_PARTITION),
            );
            self.state = state::closed_reply(state::closed_initial(self.state));
            return;
        };
        self.topic = Some(topic);
        self.configs = ex.configs.clone();
        self.state = state::opening_reply(state::opened_initial(self.state));
        engine.do_reply_begin(self.stream_id, trace_id, BeginEx::Describe(ex));
    }

    pub(crate) fn poll(&mut self, engine: &mut Engine) -> bool {
        if self.closed() || !state::reply_opened(self.state) {
            return false;
        }
        let Some(topic) = self.topic.as_ref() else {
            return false;
        };
        let config = topic.config();
        if config.version() <= self.emitted_version {
            return false;
        }
        self.emitted_version = config.version();

        let configs: Vec<(String, String)> = config
            .entries()
            .iter()
            .filter(|(name, _)| self.configs.iter().any(|wanted| wanted == name))
            .cloned()
            .collect();
        let trace_id = engine.supply_trace_id();
        engine.do_reply_data(
            self.stream_id,
            trace_id,
            FLAGS_COMPLETE,
            self.budget_id,
            0,
            None,
            DataEx::Describe(DescribeDataEx { configs }),
        );
        true
    }

    pub(crate) fn closed(&self) -> bool {
        state::closed(self.state)
    }
}

/// Serves one meta substream: snapshots of the partition→leader table.
pub struct MetaServer {
    stream_id: u64,
    route: CacheRoute,
    state: u32,
    topic: Option<Arc<Topic>>,
    emitted_version: u64,
    budget_id: u64,
}

impl MetaServer {
    pub(crate) fn new(stream_id: u64, route: CacheRoute) -> Self {
        Self {
            stream_id,
            route,
            state: 0,
            topic: None,
            emitted_version: 0,
            budget_id: 0,
        }
    }

    pub(crate) fn on_message(&mut self, engine: &mut Engine, message: Message) {
        let Message {
            half,
            trace_id,
            frame,
            ..
        } = message;
        if self.closed() {
            return;
        }
        match (half, frame) {
            (Half::Initial, Frame::Begin { extension: BeginEx::Meta(ex) }) => {
                self.on_begin(engine, trace_id, ex)
            }
            (Half::Initial, Frame::End) => {
                engine.do_reply_end(self.stream_id, trace_id);
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Initial, Frame::Abort) => {
                engine.do_reply_abort(self.stream_id, trace_id);
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Reply, Frame::Window { budget_id, .. }) => {
                self.budget_id = budget_id;
                self.state = state::opened_reply(self.state);
            }
            (Half::Reply, Frame::Reset { .. }) => {
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (half, frame) => {
                tracing::debug!(?half, ?frame, "meta server ignoring frame");
            }
        }
    }

    fn on_begin(&mut self, engine: &mut Engine, trace_id: i64, ex: MetaBeginEx) {
        let Some(topic) = resolve_topic(&self.route, engine, &ex.topic, 1) else {
            engine.do_initial_reset(
                self.stream_id,
                trace_id,
                Some(ERROR_UNKNOWN_TOPIC_OR_PARTITION),
            );
            self.state = state::closed_reply(state::closed_initial(self.state));
            return;
        };
        self.topic = Some(topic);
        self.state = state::opening_reply(state::opened_initial(self.state));
        engine.do_reply_begin(self.stream_id, trace_id, BeginEx::Meta(ex));
    }

    pub(crate) fn poll(&mut self, engine: &mut Engine) -> bool {
        if self.closed() || !state::reply_opened(self.state) {
            return false;
        }
        let Some(topic) = self.topic.as_ref() else {
            return false;
        };
        let version = self.route.cluster.version();
        if version <= self.emitted_version {
            return false;
        }
        self.emitted_version = version;

        // Absent an explicit table, every partition is led here.
        let leaders = self
            .route
            .cluster
            .leaders(topic.name())
            .unwrap_or_else(|| vec![self.route.broker_id; topic.partition_count() as usize]);
        let partitions = leaders
            .iter()
            .enumerate()
            .map(|(partition_id, leader_id)| PartitionLeader {
                partition_id: partition_id as i32,
                leader_id: *leader_id,
            })
            .collect();

        let trace_id = engine.supply_trace_id();
        engine.do_reply_data(
            self.stream_id,
            trace_id,
            FLAGS_COMPLETE,
            self.budget_id,
            0,
            None,
            DataEx::Meta(MetaDataEx { partitions }),
        );
        true
    }

    pub(crate) fn closed(&self) -> bool {
        state::closed(self.state)
    }
}

/// Serves one partition fetch substream. Owns the cursor for the
/// subscription's condition and delta mode, serves records under the
/// granted reply window, and resets with NOT_LEADER_FOR_PARTITION when
/// leadership moves off this broker.
pub struct FetchServer {
    stream_id: u64,
    route: CacheRoute,
    state: u32,
    topic_name: String,
    partition_id: i32,
    delta_type: DeltaType,
    cursor: Option<Cursor>,
    pending: Option<Record>,
    reply_budget: i64,
    reply_padding: i64,
    budget_id: u64,
}

impl FetchServer {
    pub(crate) fn new(stream_id: u64, route: CacheRoute) -> Self {
        Self {
            stream_id,
            route,
            state: 0,
            topic_name: String::new(),
            partition_id: DEFAULT_PARTITION_ID,
            delta_type: DeltaType::None,
            cursor: None,
            pending: None,
            reply_budget: 0,
            reply_padding: 0,
            budget_id: 0,
        }
    }

    pub(crate) fn on_message(&mut self, engine: &mut Engine, message: Message) {
        let Message {
            half,
            trace_id,
            frame,
            ..
        } = message;
        if self.closed() {
            return;
        }
        match (half, frame) {
            (Half::Initial, Frame::Begin { extension: BeginEx::Fetch(ex) }) => {
                self.on_begin(engine, trace_id, ex)
            }
            (Half::Initial, Frame::End) => {
                self.close_cursor();
                engine.do_reply_end(self.stream_id, trace_id);
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Initial, Frame::Abort) => {
                self.close_cursor();
                engine.do_reply_abort(self.stream_id, trace_id);
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Reply, Frame::Window {
                budget_id,
                credit,
                padding,
            }) => {
                self.budget_id = budget_id;
                self.reply_budget += credit;
                self.reply_padding = padding;
                self.state = state::opened_reply(self.state);
                self.serve(engine);
            }
            (Half::Reply, Frame::Reset { .. }) => {
                self.close_cursor();
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (half, frame) => {
                tracing::debug!(?half, ?frame, "fetch server ignoring frame");
            }
        }
    }

    #[tracing::instrument(skip_all, fields(topic = %ex.topic, partition = ex.partition.partition_id))]
    fn on_begin(&mut self, engine: &mut Engine, trace_id: i64, ex: FetchBeginEx) {
        let partition_count = ex.partition.partition_id + 1;
        let Some(topic) = resolve_topic(&self.route, engine, &ex.topic, partition_count) else {
            return self.reset(engine, trace_id, ERROR_UNKNOWN_TOPIC_OR_PARTITION);
        };
        let Some(partition) = topic.partition(ex.partition.partition_id) else {
            return self.reset(engine, trace_id, ERROR_UNKNOWN_TOPIC_OR_PARTITION);
        };
        if self.leader(&ex.topic, ex.partition.partition_id) != self.route.broker_id {
            return self.reset(engine, trace_id, ERROR_NOT_LEADER_FOR_PARTITION);
        }
        let condition = match filter::compile(&ex.filters) {
            Ok(condition) => condition,
            Err(error) => {
                tracing::warn!(%error, "rejecting fetch filters");
                return self.reset(engine, trace_id, ERROR_INVALID_REQUEST);
            }
        };

        let offset = match ex.partition.partition_offset {
            OFFSET_EARLIEST => partition.earliest_offset(),
            OFFSET_LATEST => partition.next_offset(),
            offset => offset.max(partition.earliest_offset()),
        };

        self.topic_name = ex.topic.clone();
        self.partition_id = ex.partition.partition_id;
        self.delta_type = ex.delta_type;
        self.cursor = Some(Cursor::new(
            &partition,
            condition,
            ex.delta_type,
            offset,
            i64::MAX,
        ));
        self.state = state::opening_reply(state::opened_initial(self.state));

        engine.do_reply_begin(
            self.stream_id,
            trace_id,
            BeginEx::Fetch(FetchBeginEx {
                topic: ex.topic,
                partition: PartitionOffset {
                    partition_id: ex.partition.partition_id,
                    partition_offset: offset,
                },
                filters: ex.filters,
                delta_type: ex.delta_type,
            }),
        );
    }

    fn leader(&self, topic: &str, partition_id: i32) -> i32 {
        self.route
            .cluster
            .leader(topic, partition_id)
            .unwrap_or(self.route.broker_id)
    }

    fn reset(&mut self, engine: &mut Engine, trace_id: i64, error: i32) {
        self.close_cursor();
        engine.do_initial_reset(self.stream_id, trace_id, Some(error));
        if state::reply_opening(self.state) && !state::reply_closed(self.state) {
            engine.do_reply_abort(self.stream_id, trace_id);
        }
        self.state = state::closed_reply(state::closed_initial(self.state));
    }

    pub(crate) fn poll(&mut self, engine: &mut Engine) -> bool {
        if self.closed() || !state::initial_opened(self.state) {
            return false;
        }
        if self.leader(&self.topic_name, self.partition_id) != self.route.broker_id {
            let trace_id = engine.supply_trace_id();
            tracing::debug!(
                topic = %self.topic_name,
                partition = self.partition_id,
                "leadership moved away; resetting fetch"
            );
            self.reset(engine, trace_id, ERROR_NOT_LEADER_FOR_PARTITION);
            return true;
        }
        self.serve(engine)
    }

    /// Emit deliverable records while the reply window allows.
    fn serve(&mut self, engine: &mut Engine) -> bool {
        if !state::reply_opened(self.state) || state::reply_closed(self.state) {
            return false;
        }
        let mut emitted = false;
        loop {
            let record = match self.pending.take() {
                Some(record) => record,
                None => {
                    let cursor = self.cursor.as_mut().expect("serving stream has a cursor");
                    match cursor.next() {
                        Ok(Some(record)) => record,
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(%error, "cache read failed; resetting fetch");
                            let trace_id = engine.supply_trace_id();
                            self.reset(engine, trace_id, ERROR_UNKNOWN_TOPIC_OR_PARTITION);
                            return true;
                        }
                    }
                }
            };

            let payload_length = record.value.as_ref().map(|v| v.len() as i64).unwrap_or(0);
            let reserved = payload_length + self.reply_padding;
            if reserved > self.reply_budget {
                self.pending = Some(record);
                break;
            }
            self.reply_budget -= reserved;

            let delta_type = if record.value_is_delta {
                self.delta_type
            } else {
                DeltaType::None
            };
            let ancestor_offset = if self.delta_type == DeltaType::None {
                NO_ANCESTOR
            } else {
                record.ancestor
            };

            let extension = FetchDataEx {
                timestamp: record.timestamp,
                partition: PartitionOffset {
                    partition_id: self.partition_id,
                    partition_offset: record.offset,
                },
                key: record.key.clone(),
                delta: DeltaEx {
                    delta_type,
                    ancestor_offset,
                },
                headers: record.headers.clone(),
            };

            self.cursor
                .as_mut()
                .expect("serving stream has a cursor")
                .advance(record.offset + 1);

            let trace_id = engine.supply_trace_id();
            engine.do_reply_data(
                self.stream_id,
                trace_id,
                FLAGS_COMPLETE,
                self.budget_id,
                reserved,
                record.value,
                DataEx::Fetch(extension),
            );
            metrics::counter!("topic_cache_records_served").increment(1);
            metrics::counter!("topic_cache_bytes_served").increment(payload_length as u64);
            emitted = true;
        }
        emitted
    }

    fn close_cursor(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.close();
        }
        self.pending = None;
    }

    pub(crate) fn closed(&self) -> bool {
        state::closed(self.state)
    }
}

/// Look the topic up, creating it when bootstrap allows.
fn resolve_topic(
    route: &CacheRoute,
    engine: &Engine,
    name: &str,
    partition_count: i32,
) -> Option<Arc<Topic>> {
    if let Some(topic) = route.cache.topic(name) {
        return Some(topic);
    }
    if !engine.config.topic_bootstrap_enabled {
        return None;
    }
    match route.cache.topic_or_create(name, partition_count.max(1)) {
        Ok(topic) => Some(topic),
        Err(error) => {
            tracing::warn!(%error, topic = name, "failed to bootstrap topic");
            None
        }
    }
}
