use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::partition::{Partition, SegmentConfig};
use crate::Result;

/// The configuration keys a topic carries, in the order describe reports
/// them.
pub const TOPIC_CONFIG_NAMES: [&str; 11] = [
    "cleanup.policy",
    "max.message.bytes",
    "segment.bytes",
    "segment.index.bytes",
    "segment.ms",
    "retention.bytes",
    "retention.ms",
    "delete.retention.ms",
    "min.compaction.lag.ms",
    "max.compaction.lag.ms",
    "min.cleanable.dirty.ratio",
];

const TOPIC_CONFIG_DEFAULTS: [&str; 11] = [
    "delete",
    "1000012",
    "1073741824",
    "10485760",
    "604800000",
    "-1",
    "604800000",
    "86400000",
    "0",
    "9223372036854775807",
    "0.5",
];

/// A topic's config table. Values are kept as strings, the way they are
/// described; the version counter drives snapshot re-emission.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    entries: Vec<(String, String)>,
    version: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            entries: TOPIC_CONFIG_NAMES
                .iter()
                .zip(TOPIC_CONFIG_DEFAULTS.iter())
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            version: 1,
        }
    }
}

impl TopicConfig {
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// One cached topic: a partition set plus its config table.
pub struct Topic {
    name: String,
    partitions: RwLock<Vec<Arc<Partition>>>,
    config: RwLock<TopicConfig>,
    segment_config: SegmentConfig,
    dir: PathBuf,
}

impl Topic {
    fn create(
        dir: PathBuf,
        name: &str,
        partition_count: i32,
        segment_config: SegmentConfig,
    ) -> Result<Arc<Self>> {
        let mut partitions = Vec::with_capacity(partition_count as usize);
        for id in 0..partition_count {
            partitions.push(Partition::create(
                dir.join(format!("partition-{id}")),
                id,
                segment_config,
            )?);
        }
        Ok(Arc::new(Self {
            name: name.to_string(),
            partitions: RwLock::new(partitions),
            config: RwLock::new(TopicConfig::default()),
            segment_config,
            dir,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> i32 {
        self.partitions.read().unwrap().len() as i32
    }

    pub fn partition(&self, id: i32) -> Option<Arc<Partition>> {
        self.partitions.read().unwrap().get(id as usize).cloned()
    }

    /// Grow the partition set. Partition ids are dense and stable.
    pub fn add_partitions(&self, count: i32) -> Result<()> {
        let mut partitions = self.partitions.write().unwrap();
        for _ in 0..count {
            let id = partitions.len() as i32;
            partitions.push(Partition::create(
                self.dir.join(format!("partition-{id}")),
                id,
                self.segment_config,
            )?);
        }
        Ok(())
    }

    pub fn config(&self) -> TopicConfig {
        self.config.read().unwrap().clone()
    }

    /// Update one config value, bumping the version that describe watches.
    pub fn set_config(&self, name: &str, value: &str) {
        let mut config = self.config.write().unwrap();
        for (entry_name, entry_value) in config.entries.iter_mut() {
            if entry_name == name {
                *entry_value = value.to_string();
                config.version += 1;
                return;
            }
        }
        tracing::warn!(topic = self.name, name, "ignoring unknown topic config");
    }
}

/// The root of the cache: topics by name.
pub struct TopicCache {
    dir: PathBuf,
    segment_config: SegmentConfig,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicCache {
    pub fn new(dir: PathBuf, segment_config: SegmentConfig) -> Self {
        Self {
            dir,
            segment_config,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().unwrap().get(name).cloned()
    }

    /// Fetch or create a topic. Creation is what topic bootstrap rides on.
    pub fn topic_or_create(&self, name: &str, partition_count: i32) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topic(name) {
            return Ok(topic);
        }
        let mut topics = self.topics.write().unwrap();
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic = Topic::create(
            self.dir.join(name),
            name,
            partition_count,
            self.segment_config,
        )?;
        topics.insert(name.to_string(), topic.clone());
        tracing::debug!(topic = name, partition_count, "created cache topic");
        Ok(topic)
    }
}
