use bytes::Bytes;

pub use topic_cache::{DeltaType, Filter, FilterCondition, SequenceMatch};

/// Sentinel partition offsets a subscription may carry.
pub const OFFSET_LATEST: i64 = -1;
pub const OFFSET_EARLIEST: i64 = -2;

/// The pseudo-partition whose offset is the default for partitions the
/// subscription does not list explicitly.
pub const DEFAULT_PARTITION_ID: i32 = -1;

pub const ERROR_UNKNOWN_TOPIC_OR_PARTITION: i32 = 3;
pub const ERROR_NOT_LEADER_FOR_PARTITION: i32 = 6;
pub const ERROR_INVALID_REQUEST: i32 = 42;

/// DATA frame boundary flags. Records here are always framed whole.
pub const FLAGS_FIN: u8 = 0x01;
pub const FLAGS_INIT: u8 = 0x02;
pub const FLAGS_COMPLETE: u8 = FLAGS_INIT | FLAGS_FIN;

/// Which half of a stream a frame travels on. BEGIN/DATA/END/ABORT flow
/// with the half's direction; WINDOW/RESET flow against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Initial,
    Reply,
}

/// One queued frame. The envelope's route rides on the stream pair the
/// fabric keeps per stream id, and the direction bit of a stream id is
/// carried as the `half` instead.
#[derive(Debug, Clone)]
pub struct Message {
    pub stream_id: u64,
    pub half: Half,
    pub trace_id: i64,
    pub frame: Frame,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Begin {
        extension: BeginEx,
    },
    Data {
        flags: u8,
        budget_id: u64,
        reserved: i64,
        payload: Option<Bytes>,
        extension: DataEx,
    },
    End,
    Abort,
    Window {
        budget_id: u64,
        credit: i64,
        padding: i64,
    },
    Reset {
        error: Option<i32>,
    },
}

#[derive(Debug, Clone)]
pub enum BeginEx {
    None,
    Merged(MergedBeginEx),
    Describe(DescribeBeginEx),
    Meta(MetaBeginEx),
    Fetch(FetchBeginEx),
}

#[derive(Debug, Clone)]
pub enum DataEx {
    None,
    Merged(MergedDataEx),
    Describe(DescribeDataEx),
    Meta(MetaDataEx),
    Fetch(FetchDataEx),
}

/// A (partition, offset) pair, used both for subscription positions and
/// for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffset {
    pub partition_id: i32,
    pub partition_offset: i64,
}

#[derive(Debug, Clone)]
pub struct MergedBeginEx {
    pub topic: String,
    pub partitions: Vec<PartitionOffset>,
    pub filters: Vec<Filter>,
    pub delta_type: DeltaType,
}

#[derive(Debug, Clone)]
pub struct DescribeBeginEx {
    pub topic: String,
    pub configs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MetaBeginEx {
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct FetchBeginEx {
    pub topic: String,
    pub partition: PartitionOffset,
    pub filters: Vec<Filter>,
    pub delta_type: DeltaType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaEx {
    pub delta_type: DeltaType,
    pub ancestor_offset: i64,
}

impl Default for DeltaEx {
    fn default() -> Self {
        Self {
            delta_type: DeltaType::None,
            ancestor_offset: -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchDataEx {
    pub timestamp: i64,
    pub partition: PartitionOffset,
    pub key: Option<Bytes>,
    pub delta: DeltaEx,
    pub headers: Vec<(Bytes, Bytes)>,
}

/// The per-record extension a merged stream's client receives: the record
/// itself plus the full progress vector it can resume from.
#[derive(Debug, Clone)]
pub struct MergedDataEx {
    pub timestamp: i64,
    pub partition: PartitionOffset,
    pub progress: Vec<PartitionOffset>,
    pub key: Option<Bytes>,
    pub delta: DeltaEx,
    pub headers: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone)]
pub struct DescribeDataEx {
    pub configs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MetaDataEx {
    pub partitions: Vec<PartitionLeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeader {
    pub partition_id: i32,
    pub leader_id: i32,
}
