use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use topic_cache::topic::TOPIC_CONFIG_NAMES;
use topic_cache::{filter, DeltaType, Filter};

use crate::config::GatewayConfig;
use crate::fabric::{EndpointId, Engine, MergedRoute, Peer};
use crate::frame::{
    BeginEx, DataEx, DescribeBeginEx, FetchBeginEx, FetchDataEx, Frame, Half, MergedBeginEx,
    MergedDataEx, Message, MetaBeginEx, PartitionLeader, PartitionOffset, DEFAULT_PARTITION_ID,
    ERROR_INVALID_REQUEST, ERROR_NOT_LEADER_FOR_PARTITION, FLAGS_COMPLETE, OFFSET_EARLIEST,
};
use crate::state;

/// Nominal window granted on the describe and meta replies, whose frames
/// carry no payload.
const CONTROL_WINDOW: i64 = 1 << 14;

/// One client subscription: drives a describe substream for topic
/// existence, a meta substream for the partition→leader table, and one
/// fetch substream per partition, merging everything back into the
/// client-facing reply.
///
/// Progress is a per-partition next-offset vector. It gates the client
/// reply open (every expected partition must report in), stamps every
/// forwarded record so the client can resume, and seeds replacement
/// fetches across leadership changes.
pub struct MergedFetchStream {
    endpoint_id: EndpointId,
    stream_id: u64,
    route: MergedRoute,
    config: Arc<GatewayConfig>,
    state: u32,

    topic: String,
    delta_type: DeltaType,
    filters: Vec<Filter>,
    default_offset: i64,
    initial_offsets: HashMap<i32, i64>,
    next_offsets: BTreeMap<i32, i64>,

    describe: Option<SubStream>,
    meta: Option<SubStream>,
    fetches: Vec<FetchStream>,
    fetch_index: usize,
    budget_id: Option<u64>,
}

struct SubStream {
    stream_id: u64,
    state: u32,
}

struct FetchStream {
    stream_id: u64,
    partition_id: i32,
    leader_id: i32,
    state: u32,
    /// Credit granted downstream and not yet consumed by arriving data.
    outstanding: i64,
}

impl MergedFetchStream {
    pub(crate) fn new(
        endpoint_id: EndpointId,
        stream_id: u64,
        route: MergedRoute,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            endpoint_id,
            stream_id,
            route,
            config,
            state: 0,
            topic: String::new(),
            delta_type: DeltaType::None,
            filters: Vec::new(),
            default_offset: OFFSET_EARLIEST,
            initial_offsets: HashMap::new(),
            next_offsets: BTreeMap::new(),
            describe: None,
            meta: None,
            fetches: Vec::new(),
            fetch_index: 0,
            budget_id: None,
        }
    }

    pub(crate) fn on_message(&mut self, engine: &mut Engine, message: Message) {
        let Message {
            stream_id,
            half,
            trace_id,
            frame,
        } = message;

        if state::closed(self.state) {
            tracing::debug!(stream_id, "closed merged stream ignoring frame");
            return;
        }
        if stream_id == self.stream_id {
            return self.on_merged_frame(engine, half, trace_id, frame);
        }
        if self.describe.as_ref().map(|s| s.stream_id) == Some(stream_id) {
            return self.on_describe_frame(engine, half, trace_id, frame);
        }
        if self.meta.as_ref().map(|s| s.stream_id) == Some(stream_id) {
            return self.on_meta_frame(engine, half, trace_id, frame);
        }
        if let Some(index) = self
            .fetches
            .iter()
            .position(|fetch| fetch.stream_id == stream_id)
        {
            return self.on_fetch_frame(engine, index, half, trace_id, frame);
        }
        // Frames for substreams already closed out (leadership churn).
        tracing::debug!(stream_id, "merged stream ignoring frame for departed substream");
    }

    fn on_merged_frame(&mut self, engine: &mut Engine, half: Half, trace_id: i64, frame: Frame) {
        match (half, frame) {
            (Half::Initial, Frame::Begin { extension: BeginEx::Merged(ex) }) => {
                self.on_initial_begin(engine, trace_id, ex)
            }
            (Half::Initial, Frame::Begin { .. }) => {
                tracing::warn!("merged stream opened without a merged extension");
                engine.do_initial_reset(self.stream_id, trace_id, Some(ERROR_INVALID_REQUEST));
                self.state = state::closed_reply(state::closed_initial(self.state));
            }
            (Half::Initial, Frame::End) => {
                self.state = state::closed_initial(self.state);
                self.teardown(engine, trace_id, Teardown::End);
            }
            (Half::Initial, Frame::Abort) => {
                self.state = state::closed_initial(self.state);
                self.teardown(engine, trace_id, Teardown::Abort);
            }
            (Half::Reply, Frame::Window { budget_id, credit, .. }) => {
                self.on_reply_window(engine, trace_id, budget_id, credit)
            }
            (Half::Reply, Frame::Reset { .. }) => {
                self.state = state::closed_reply(self.state);
                self.teardown(engine, trace_id, Teardown::Reset { error: None });
            }
            (half, frame) => {
                tracing::debug!(?half, ?frame, "merged stream ignoring client frame");
            }
        }
    }

    #[tracing::instrument(skip_all, fields(topic = %ex.topic, delta = ?ex.delta_type))]
    fn on_initial_begin(&mut self, engine: &mut Engine, trace_id: i64, ex: MergedBeginEx) {
        if ex.topic.is_empty() {
            engine.do_initial_reset(self.stream_id, trace_id, Some(ERROR_INVALID_REQUEST));
            self.state = state::closed_reply(state::closed_initial(self.state));
            return;
        }
        if let Err(error) = filter::compile(&ex.filters) {
            tracing::warn!(%error, "rejecting merged subscription filters");
            engine.do_initial_reset(self.stream_id, trace_id, Some(ERROR_INVALID_REQUEST));
            self.state = state::closed_reply(state::closed_initial(self.state));
            return;
        }

        self.topic = ex.topic;
        self.delta_type = ex.delta_type;
        self.filters = ex.filters;
        for partition in &ex.partitions {
            if partition.partition_id == DEFAULT_PARTITION_ID {
                self.default_offset = partition.partition_offset;
            } else {
                self.initial_offsets
                    .insert(partition.partition_id, partition.partition_offset);
            }
        }
        self.state = state::opened_initial(self.state);

        let describe_id = engine.open_stream(
            self.route.bootstrap_route_id,
            Peer::Endpoint(self.endpoint_id),
            trace_id,
            BeginEx::Describe(DescribeBeginEx {
                topic: self.topic.clone(),
                configs: TOPIC_CONFIG_NAMES.iter().map(|name| name.to_string()).collect(),
            }),
        );
        self.describe = Some(SubStream {
            stream_id: describe_id,
            state: state::opening_initial(0),
        });
    }

    fn on_describe_frame(&mut self, engine: &mut Engine, half: Half, trace_id: i64, frame: Frame) {
        let describe = self.describe.as_mut().expect("describe substream exists");
        match (half, frame) {
            (Half::Reply, Frame::Begin { .. }) => {
                describe.state = state::opened_reply(state::opened_initial(describe.state));
                engine.do_reply_window(describe.stream_id, trace_id, 0, CONTROL_WINDOW, 0);
            }
            (Half::Reply, Frame::Data { extension: DataEx::Describe(_), .. }) => {
                self.on_topic_config_changed(engine, trace_id);
            }
            (Half::Reply, Frame::End) | (Half::Reply, Frame::Abort) => {
                self.teardown(engine, trace_id, Teardown::Reset { error: None });
            }
            (Half::Initial, Frame::Reset { error }) => {
                tracing::warn!(?error, "describe substream reset");
                self.teardown(engine, trace_id, Teardown::Reset { error });
            }
            (Half::Initial, Frame::Window { .. }) => (),
            (half, frame) => {
                tracing::debug!(?half, ?frame, "ignoring describe frame");
            }
        }
    }

    /// Topic configuration arrived: the topic exists, so the meta
    /// substream can open. Idempotent across config re-emissions.
    fn on_topic_config_changed(&mut self, engine: &mut Engine, trace_id: i64) {
        if self.meta.is_some() {
            return;
        }
        let meta_id = engine.open_stream(
            self.route.bootstrap_route_id,
            Peer::Endpoint(self.endpoint_id),
            trace_id,
            BeginEx::Meta(MetaBeginEx {
                topic: self.topic.clone(),
            }),
        );
        self.meta = Some(SubStream {
            stream_id: meta_id,
            state: state::opening_initial(0),
        });
    }

    fn on_meta_frame(&mut self, engine: &mut Engine, half: Half, trace_id: i64, frame: Frame) {
        let meta = self.meta.as_mut().expect("meta substream exists");
        match (half, frame) {
            (Half::Reply, Frame::Begin { .. }) => {
                meta.state = state::opened_reply(state::opened_initial(meta.state));
                engine.do_reply_window(meta.stream_id, trace_id, 0, CONTROL_WINDOW, 0);
            }
            (Half::Reply, Frame::Data { extension: DataEx::Meta(ex), .. }) => {
                self.on_topic_meta_changed(engine, trace_id, ex.partitions);
            }
            (Half::Reply, Frame::End) | (Half::Reply, Frame::Abort) => {
                self.teardown(engine, trace_id, Teardown::Reset { error: None });
            }
            (Half::Initial, Frame::Reset { error }) => {
                tracing::warn!(?error, "meta substream reset");
                self.teardown(engine, trace_id, Teardown::Reset { error });
            }
            (Half::Initial, Frame::Window { .. }) => (),
            (half, frame) => {
                tracing::debug!(?half, ?frame, "ignoring meta frame");
            }
        }
    }

    /// Reconcile the fetch set against a partition→leader snapshot:
    /// vanished partitions close, new partitions open, moved leaders are
    /// replaced at the retained progress offset.
    fn on_topic_meta_changed(
        &mut self,
        engine: &mut Engine,
        trace_id: i64,
        partitions: Vec<PartitionLeader>,
    ) {
        let table: HashMap<i32, i32> = partitions
            .iter()
            .map(|pl| (pl.partition_id, pl.leader_id))
            .collect();

        let mut index = 0;
        while index < self.fetches.len() {
            if table.contains_key(&self.fetches[index].partition_id) {
                index += 1;
            } else {
                let fetch = self.fetches.remove(index);
                tracing::debug!(partition = fetch.partition_id, "partition left the table");
                self.next_offsets.remove(&fetch.partition_id);
                close_fetch(engine, trace_id, &fetch);
            }
        }

        for pl in partitions {
            match self
                .fetches
                .iter()
                .position(|fetch| fetch.partition_id == pl.partition_id)
            {
                Some(index) if self.fetches[index].leader_id == pl.leader_id => (),
                Some(index) => {
                    let old = self.fetches.remove(index);
                    tracing::debug!(
                        partition = pl.partition_id,
                        from = old.leader_id,
                        to = pl.leader_id,
                        "partition leadership moved"
                    );
                    close_fetch(engine, trace_id, &old);
                    self.open_fetch(engine, trace_id, pl);
                }
                None => self.open_fetch(engine, trace_id, pl),
            }
        }

        self.maybe_open_reply(engine, trace_id);
    }

    fn open_fetch(&mut self, engine: &mut Engine, trace_id: i64, pl: PartitionLeader) {
        let offset = self
            .next_offsets
            .get(&pl.partition_id)
            .or_else(|| self.initial_offsets.get(&pl.partition_id))
            .copied()
            .unwrap_or(self.default_offset);

        let Some(route_id) = self.route.broker_routes.get(&pl.leader_id).copied() else {
            tracing::warn!(leader = pl.leader_id, "no route to partition leader");
            self.teardown(engine, trace_id, Teardown::Reset { error: None });
            return;
        };

        let stream_id = engine.open_stream(
            route_id,
            Peer::Endpoint(self.endpoint_id),
            trace_id,
            BeginEx::Fetch(FetchBeginEx {
                topic: self.topic.clone(),
                partition: PartitionOffset {
                    partition_id: pl.partition_id,
                    partition_offset: offset,
                },
                filters: self.filters.clone(),
                delta_type: self.delta_type,
            }),
        );
        self.fetches.push(FetchStream {
            stream_id,
            partition_id: pl.partition_id,
            leader_id: pl.leader_id,
            state: state::opening_initial(0),
            outstanding: 0,
        });
    }

    fn on_fetch_frame(
        &mut self,
        engine: &mut Engine,
        index: usize,
        half: Half,
        trace_id: i64,
        frame: Frame,
    ) {
        match (half, frame) {
            (Half::Reply, Frame::Begin { extension: BeginEx::Fetch(ex) }) => {
                let fetch = &mut self.fetches[index];
                fetch.state = state::opened_reply(state::opened_initial(fetch.state));
                self.next_offsets
                    .entry(ex.partition.partition_id)
                    .or_insert(ex.partition.partition_offset);
                self.maybe_open_reply(engine, trace_id);
                self.distribute_credit(engine, trace_id);
            }
            (Half::Reply, Frame::Data {
                reserved,
                payload,
                extension: DataEx::Fetch(ex),
                ..
            }) => {
                self.on_fetch_data(engine, index, trace_id, reserved, payload, ex);
            }
            (Half::Initial, Frame::Reset { error }) => {
                if error == Some(ERROR_NOT_LEADER_FOR_PARTITION) {
                    // Recoverable: drop this fetch and let the next meta
                    // snapshot place a successor. Progress is retained.
                    let fetch = self.fetches.remove(index);
                    tracing::debug!(
                        partition = fetch.partition_id,
                        "fetch lost leadership; awaiting meta"
                    );
                } else {
                    tracing::warn!(?error, "fetch substream reset");
                    self.teardown(engine, trace_id, Teardown::Reset { error });
                }
            }
            (Half::Reply, Frame::End) | (Half::Reply, Frame::Abort) => {
                self.teardown(engine, trace_id, Teardown::Reset { error: None });
            }
            (Half::Initial, Frame::Window { .. }) => (),
            (half, frame) => {
                tracing::debug!(?half, ?frame, "ignoring fetch frame");
            }
        }
    }

    /// A record arrived from one partition: charge its reservation,
    /// advance that partition's progress, and forward it to the client
    /// with the full progress vector stamped on.
    fn on_fetch_data(
        &mut self,
        engine: &mut Engine,
        index: usize,
        trace_id: i64,
        reserved: i64,
        payload: Option<bytes::Bytes>,
        ex: FetchDataEx,
    ) {
        let fetch = &mut self.fetches[index];
        fetch.outstanding -= reserved;
        if fetch.outstanding < 0 {
            tracing::warn!(
                partition = fetch.partition_id,
                reserved,
                "fetch overran its reply window"
            );
            self.teardown(
                engine,
                trace_id,
                Teardown::Reset {
                    error: Some(ERROR_INVALID_REQUEST),
                },
            );
            return;
        }

        self.next_offsets
            .insert(ex.partition.partition_id, ex.partition.partition_offset + 1);

        let extension = MergedDataEx {
            timestamp: ex.timestamp,
            partition: ex.partition,
            progress: self.progress(),
            key: ex.key,
            delta: ex.delta,
            headers: ex.headers,
        };
        engine.do_reply_data(
            self.stream_id,
            trace_id,
            FLAGS_COMPLETE,
            self.budget_id.unwrap_or(0),
            reserved,
            payload,
            DataEx::Merged(extension),
        );
        metrics::counter!("merged_fetch_records_forwarded").increment(1);
    }

    /// Open the client reply once every expected partition has reported
    /// its fetch reply, so the first progress vector is complete.
    fn maybe_open_reply(&mut self, engine: &mut Engine, trace_id: i64) {
        if state::reply_opening(self.state) || self.fetches.is_empty() {
            return;
        }
        if self.next_offsets.len() != self.fetches.len() {
            return;
        }
        self.state = state::opening_reply(self.state);
        engine.do_reply_begin(
            self.stream_id,
            trace_id,
            BeginEx::Merged(MergedBeginEx {
                topic: self.topic.clone(),
                partitions: self.progress(),
                filters: self.filters.clone(),
                delta_type: self.delta_type,
            }),
        );
    }

    fn on_reply_window(&mut self, engine: &mut Engine, trace_id: i64, budget_id: u64, credit: i64) {
        let merged_budget_id = match self.budget_id {
            Some(id) => id,
            None => {
                let id = engine.creditor.acquire(self.stream_id | 1, budget_id);
                self.budget_id = Some(id);
                id
            }
        };
        engine.creditor.credit(trace_id, merged_budget_id, credit);
        self.state = state::opened_reply(self.state);
        self.distribute_credit(engine, trace_id);
    }

    /// Round-robin distribution of merged credit into per-partition
    /// windows, starting where the last pass left off so tail partitions
    /// are not starved under tight credit.
    fn distribute_credit(&mut self, engine: &mut Engine, trace_id: i64) {
        let Some(budget_id) = self.budget_id else {
            return;
        };
        let count = self.fetches.len();
        if count == 0 {
            return;
        }
        let outstanding: i64 = self.fetches.iter().map(|fetch| fetch.outstanding).sum();
        let mut merged_headroom = self.config.fetch_max_bytes - outstanding;

        let start = self.fetch_index % count;
        for step in 0..count {
            if merged_headroom <= 0 {
                break;
            }
            let fetch = &mut self.fetches[(start + step) % count];
            if !state::reply_opened(fetch.state) {
                continue;
            }
            let headroom =
                (self.config.fetch_partition_max_bytes - fetch.outstanding).min(merged_headroom);
            if headroom <= 0 {
                continue;
            }
            let granted = engine.creditor.claim(budget_id, headroom);
            if granted == 0 {
                break;
            }
            fetch.outstanding += granted;
            merged_headroom -= granted;
            engine.do_reply_window(fetch.stream_id, trace_id, budget_id, granted, 0);
        }
        self.fetch_index = self.fetch_index.wrapping_add(1);
    }

    fn progress(&self) -> Vec<PartitionOffset> {
        self.next_offsets
            .iter()
            .map(|(partition_id, partition_offset)| PartitionOffset {
                partition_id: *partition_id,
                partition_offset: *partition_offset,
            })
            .collect()
    }

    /// Close every substream and the client-facing halves. `End` is the
    /// graceful path; `Abort` and `Reset` cascade a failure.
    fn teardown(&mut self, engine: &mut Engine, trace_id: i64, how: Teardown) {
        if state::closed(self.state) {
            return;
        }

        for fetch in self.fetches.drain(..) {
            close_fetch(engine, trace_id, &fetch);
        }
        for sub in self.describe.take().into_iter().chain(self.meta.take()) {
            match how {
                Teardown::End => engine.do_initial_end(sub.stream_id, trace_id),
                _ => engine.do_initial_abort(sub.stream_id, trace_id),
            }
            engine.do_reply_reset(sub.stream_id, trace_id, None);
        }

        if state::reply_opening(self.state) && !state::reply_closed(self.state) {
            match how {
                Teardown::End => engine.do_reply_end(self.stream_id, trace_id),
                _ => engine.do_reply_abort(self.stream_id, trace_id),
            }
        }
        if !state::initial_closed(self.state) {
            let error = match how {
                Teardown::Reset { error } => error,
                _ => None,
            };
            engine.do_initial_reset(self.stream_id, trace_id, error);
        }

        if let Some(budget_id) = self.budget_id.take() {
            engine.creditor.release(budget_id);
        }
        self.state = state::closed_reply(state::closed_initial(self.state));
        tracing::debug!(topic = %self.topic, ?how, "merged stream closed");
    }

    pub(crate) fn closed(&self) -> bool {
        state::closed(self.state)
    }
}

#[derive(Debug, Clone, Copy)]
enum Teardown {
    End,
    Abort,
    Reset { error: Option<i32> },
}

fn close_fetch(engine: &mut Engine, trace_id: i64, fetch: &FetchStream) {
    engine.do_initial_end(fetch.stream_id, trace_id);
    engine.do_reply_reset(fetch.stream_id, trace_id, None);
}
