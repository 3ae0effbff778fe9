//! On-disk partitioned topic cache with filtered cursors.
//!
//! A topic is a set of partitions; a partition is a chain of append-only
//! segments; a segment owns four files: the log itself, an offset index,
//! a hash index over keys and header values, and a delta file of encoded
//! diffs between successive values of the same key. Readers walk a
//! partition through a [`cursor::Cursor`] under a
//! [`condition::Condition`] compiled from client filters.

mod file;

pub mod condition;
pub mod cursor;
pub mod filter;
pub mod index;
pub mod partition;
pub mod record;
pub mod segment;
pub mod topic;

pub use cursor::Cursor;
pub use filter::{Filter, FilterCondition, FilterError, SequenceMatch};
pub use partition::{AppendRecord, Partition, PartitionAppender, SegmentConfig};
pub use record::Record;
pub use topic::{Topic, TopicCache};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt cache entry at position {position}")]
    Corrupt { position: u32 },
    #[error("cache file capacity {capacity} exceeded by append of {length} at {at}")]
    Capacity { capacity: u32, length: u32, at: u32 },
    #[error("record of {length} bytes cannot fit any segment")]
    Oversized { length: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How record values are transported relative to the prior version of the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaType {
    None,
    JsonPatch,
}

impl Default for DeltaType {
    fn default() -> Self {
        DeltaType::None
    }
}
