use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use topic_cache::TopicCache;

use crate::budget::MergedBudgetCreditor;
use crate::config::GatewayConfig;
use crate::frame::{BeginEx, DataEx, Frame, Half, Message};
use crate::merged::MergedFetchStream;
use crate::serve::{ClusterView, DescribeServer, FetchServer, MetaServer};

pub(crate) type EndpointId = u64;

/// One side of a stream pair: an in-fabric endpoint, or the external
/// party driving the fabric from outside (a test harness, a transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Peer {
    External,
    Endpoint(EndpointId),
}

struct Pair {
    route_id: i64,
    initiator: Peer,
    acceptor: Option<Peer>,
}

/// Route target for merged subscriptions: where describe and meta open,
/// and where each broker's partition fetches open.
#[derive(Debug, Clone)]
pub struct MergedRoute {
    pub bootstrap_route_id: i64,
    pub broker_routes: HashMap<i32, i64>,
}

/// Route target serving describe/meta/fetch out of a topic cache on
/// behalf of one broker.
#[derive(Clone)]
pub struct CacheRoute {
    pub broker_id: i32,
    pub cache: Arc<TopicCache>,
    pub cluster: Arc<ClusterView>,
}

enum Route {
    Merged(MergedRoute),
    Cache(CacheRoute),
}

/// The frame-queue half of the fabric: stream pairs, routing, credit, and
/// the send helpers endpoints emit through. Split from the endpoint table
/// so a handler can emit while it is being dispatched.
pub struct Engine {
    pub config: Arc<GatewayConfig>,
    pub creditor: MergedBudgetCreditor,
    queue: VecDeque<Message>,
    pairs: HashMap<u64, Pair>,
    routes: HashMap<i64, Route>,
    outbox: HashMap<u64, Vec<Message>>,
    next_stream_id: u64,
    next_trace_id: i64,
    next_route_id: i64,
}

impl Engine {
    fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
            creditor: MergedBudgetCreditor::default(),
            queue: VecDeque::new(),
            pairs: HashMap::new(),
            routes: HashMap::new(),
            outbox: HashMap::new(),
            next_stream_id: 0,
            next_trace_id: 0,
            next_route_id: 0,
        }
    }

    pub fn supply_trace_id(&mut self) -> i64 {
        self.next_trace_id += 1;
        self.next_trace_id
    }

    /// Stream ids keep the low bit clear; a frame's half carries the
    /// direction bit instead.
    fn supply_stream_id(&mut self) -> u64 {
        self.next_stream_id += 2;
        self.next_stream_id
    }

    fn enqueue(&mut self, stream_id: u64, half: Half, trace_id: i64, frame: Frame) {
        self.queue.push_back(Message {
            stream_id,
            half,
            trace_id,
            frame,
        });
    }

    /// Open a new stream toward `route_id`, enqueueing its initial BEGIN.
    pub(crate) fn open_stream(
        &mut self,
        route_id: i64,
        initiator: Peer,
        trace_id: i64,
        extension: BeginEx,
    ) -> u64 {
        let stream_id = self.supply_stream_id();
        self.pairs.insert(
            stream_id,
            Pair {
                route_id,
                initiator,
                acceptor: None,
            },
        );
        self.enqueue(stream_id, Half::Initial, trace_id, Frame::Begin { extension });
        stream_id
    }

    // Initiator-side sends.

    pub(crate) fn do_initial_end(&mut self, stream_id: u64, trace_id: i64) {
        self.enqueue(stream_id, Half::Initial, trace_id, Frame::End);
    }

    pub(crate) fn do_initial_abort(&mut self, stream_id: u64, trace_id: i64) {
        self.enqueue(stream_id, Half::Initial, trace_id, Frame::Abort);
    }

    pub(crate) fn do_reply_window(
        &mut self,
        stream_id: u64,
        trace_id: i64,
        budget_id: u64,
        credit: i64,
        padding: i64,
    ) {
        self.enqueue(
            stream_id,
            Half::Reply,
            trace_id,
            Frame::Window {
                budget_id,
                credit,
                padding,
            },
        );
    }

    pub(crate) fn do_reply_reset(&mut self, stream_id: u64, trace_id: i64, error: Option<i32>) {
        self.enqueue(stream_id, Half::Reply, trace_id, Frame::Reset { error });
    }

    // Acceptor-side sends.

    pub(crate) fn do_reply_begin(&mut self, stream_id: u64, trace_id: i64, extension: BeginEx) {
        self.enqueue(stream_id, Half::Reply, trace_id, Frame::Begin { extension });
    }

    pub(crate) fn do_reply_data(
        &mut self,
        stream_id: u64,
        trace_id: i64,
        flags: u8,
        budget_id: u64,
        reserved: i64,
        payload: Option<bytes::Bytes>,
        extension: DataEx,
    ) {
        self.enqueue(
            stream_id,
            Half::Reply,
            trace_id,
            Frame::Data {
                flags,
                budget_id,
                reserved,
                payload,
                extension,
            },
        );
    }

    pub(crate) fn do_reply_end(&mut self, stream_id: u64, trace_id: i64) {
        self.enqueue(stream_id, Half::Reply, trace_id, Frame::End);
    }

    pub(crate) fn do_reply_abort(&mut self, stream_id: u64, trace_id: i64) {
        self.enqueue(stream_id, Half::Reply, trace_id, Frame::Abort);
    }

    pub(crate) fn do_initial_window(
        &mut self,
        stream_id: u64,
        trace_id: i64,
        budget_id: u64,
        credit: i64,
        padding: i64,
    ) {
        self.enqueue(
            stream_id,
            Half::Initial,
            trace_id,
            Frame::Window {
                budget_id,
                credit,
                padding,
            },
        );
    }

    pub(crate) fn do_initial_reset(&mut self, stream_id: u64, trace_id: i64, error: Option<i32>) {
        self.enqueue(stream_id, Half::Initial, trace_id, Frame::Reset { error });
    }
}

enum Endpoint {
    Merged(MergedFetchStream),
    Describe(DescribeServer),
    Meta(MetaServer),
    Fetch(FetchServer),
}

impl Endpoint {
    fn on_message(&mut self, engine: &mut Engine, message: Message) {
        match self {
            Endpoint::Merged(stream) => stream.on_message(engine, message),
            Endpoint::Describe(server) => server.on_message(engine, message),
            Endpoint::Meta(server) => server.on_message(engine, message),
            Endpoint::Fetch(server) => server.on_message(engine, message),
        }
    }

    fn poll(&mut self, engine: &mut Engine) -> bool {
        match self {
            Endpoint::Merged(_) => false,
            Endpoint::Describe(server) => server.poll(engine),
            Endpoint::Meta(server) => server.poll(engine),
            Endpoint::Fetch(server) => server.poll(engine),
        }
    }

    fn closed(&self) -> bool {
        match self {
            Endpoint::Merged(stream) => stream.closed(),
            Endpoint::Describe(server) => server.closed(),
            Endpoint::Meta(server) => server.closed(),
            Endpoint::Fetch(server) => server.closed(),
        }
    }
}

/// The cooperative dispatcher: owns every coordinator, substream and
/// serving stream, and runs queued frames to completion with no
/// intra-stream locking. Serving streams additionally get a poll pass so
/// cache appends and leadership changes surface without a frame to wake
/// them.
pub struct Fabric {
    engine: Engine,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    next_endpoint_id: EndpointId,
}

impl Fabric {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            engine: Engine::new(config),
            endpoints: BTreeMap::new(),
            next_endpoint_id: 0,
        }
    }

    /// Register a cache-serving route on behalf of `broker_id`.
    pub fn add_cache_server(
        &mut self,
        broker_id: i32,
        cache: Arc<TopicCache>,
        cluster: Arc<ClusterView>,
    ) -> i64 {
        self.add_route(Route::Cache(CacheRoute {
            broker_id,
            cache,
            cluster,
        }))
    }

    /// Register the client-facing merged route.
    pub fn add_merged_server(&mut self, route: MergedRoute) -> i64 {
        self.add_route(Route::Merged(route))
    }

    fn add_route(&mut self, route: Route) -> i64 {
        self.engine.next_route_id += 1;
        let route_id = self.engine.next_route_id;
        self.engine.routes.insert(route_id, route);
        route_id
    }

    /// Open a stream from the external party toward `route_id`.
    pub fn open(&mut self, route_id: i64, extension: BeginEx) -> u64 {
        let trace_id = self.engine.supply_trace_id();
        self.engine
            .open_stream(route_id, Peer::External, trace_id, extension)
    }

    pub fn initial_end(&mut self, stream_id: u64) {
        let trace_id = self.engine.supply_trace_id();
        self.engine.do_initial_end(stream_id, trace_id);
    }

    pub fn initial_abort(&mut self, stream_id: u64) {
        let trace_id = self.engine.supply_trace_id();
        self.engine.do_initial_abort(stream_id, trace_id);
    }

    pub fn reply_window(&mut self, stream_id: u64, budget_id: u64, credit: i64, padding: i64) {
        let trace_id = self.engine.supply_trace_id();
        self.engine
            .do_reply_window(stream_id, trace_id, budget_id, credit, padding);
    }

    pub fn reply_reset(&mut self, stream_id: u64, error: Option<i32>) {
        let trace_id = self.engine.supply_trace_id();
        self.engine.do_reply_reset(stream_id, trace_id, error);
    }

    /// Run queued frames and poll passes until the fabric quiesces.
    pub fn run(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(message) = self.engine.queue.pop_front() {
                self.deliver(message);
                progressed = true;
            }
            let ids: Vec<EndpointId> = self.endpoints.keys().copied().collect();
            for id in ids {
                if let Some(endpoint) = self.endpoints.get_mut(&id) {
                    progressed |= endpoint.poll(&mut self.engine);
                }
            }
            if !progressed && self.engine.queue.is_empty() {
                break;
            }
        }
        self.endpoints.retain(|_, endpoint| !endpoint.closed());
    }

    /// Run, then take every frame delivered to the external side of
    /// `stream_id`.
    pub fn drain(&mut self, stream_id: u64) -> Vec<Message> {
        self.run();
        self.engine.outbox.remove(&stream_id).unwrap_or_default()
    }

    fn deliver(&mut self, message: Message) {
        let Some(pair) = self.engine.pairs.get(&message.stream_id) else {
            tracing::debug!(stream_id = message.stream_id, "frame for an unknown stream");
            return;
        };
        let (route_id, initiator, acceptor) = (pair.route_id, pair.initiator, pair.acceptor);

        let to_acceptor = matches!(
            (message.half, &message.frame),
            (
                Half::Initial,
                Frame::Begin { .. } | Frame::Data { .. } | Frame::End | Frame::Abort
            ) | (Half::Reply, Frame::Window { .. } | Frame::Reset { .. })
        );

        let peer = if to_acceptor {
            match acceptor {
                Some(peer) => peer,
                None if matches!(message.frame, Frame::Begin { .. }) => {
                    match self.accept(route_id, message.stream_id, &message) {
                        Some(id) => {
                            let peer = Peer::Endpoint(id);
                            self.engine
                                .pairs
                                .get_mut(&message.stream_id)
                                .unwrap()
                                .acceptor = Some(peer);
                            peer
                        }
                        None => {
                            tracing::warn!(route_id, "no acceptor for stream; resetting");
                            self.engine
                                .do_initial_reset(message.stream_id, message.trace_id, None);
                            return;
                        }
                    }
                }
                None => {
                    tracing::debug!(stream_id = message.stream_id, "frame before BEGIN; dropped");
                    return;
                }
            }
        } else {
            initiator
        };

        match peer {
            Peer::External => self
                .engine
                .outbox
                .entry(message.stream_id)
                .or_default()
                .push(message),
            Peer::Endpoint(id) => match self.endpoints.get_mut(&id) {
                Some(endpoint) => endpoint.on_message(&mut self.engine, message),
                None => {
                    tracing::debug!(stream_id = message.stream_id, "frame for a departed endpoint")
                }
            },
        }
    }

    /// Build the accepting endpoint for an arriving BEGIN.
    fn accept(&mut self, route_id: i64, stream_id: u64, message: &Message) -> Option<EndpointId> {
        let Frame::Begin { extension } = &message.frame else {
            return None;
        };
        self.next_endpoint_id += 1;
        let id = self.next_endpoint_id;

        let endpoint = match self.engine.routes.get(&route_id)? {
            Route::Merged(route) => Endpoint::Merged(MergedFetchStream::new(
                id,
                stream_id,
                route.clone(),
                self.engine.config.clone(),
            )),
            Route::Cache(route) => match extension {
                BeginEx::Describe(_) => {
                    Endpoint::Describe(DescribeServer::new(stream_id, route.clone()))
                }
                BeginEx::Meta(_) => Endpoint::Meta(MetaServer::new(stream_id, route.clone())),
                BeginEx::Fetch(_) => Endpoint::Fetch(FetchServer::new(stream_id, route.clone())),
                _ => {
                    tracing::warn!(route_id, "cache route cannot accept this BEGIN");
                    return None;
                }
            },
        };
        self.endpoints.insert(id, endpoint);
        Some(id)
    }
}
