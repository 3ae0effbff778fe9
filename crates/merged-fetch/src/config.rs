use serde::Deserialize;

/// Process-wide gateway configuration, deserialized with the dotted
/// property names it is configured under.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Upper bound on a merged reply's outstanding bytes.
    #[serde(rename = "fetch.max.bytes", default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i64,

    /// Upper bound on any one partition fetch's outstanding bytes.
    #[serde(
        rename = "fetch.partition.max.bytes",
        default = "default_fetch_partition_max_bytes"
    )]
    pub fetch_partition_max_bytes: i64,

    /// Whether describing an unknown topic creates it in the cache.
    #[serde(rename = "topic.bootstrap.enabled", default = "default_topic_bootstrap")]
    pub topic_bootstrap_enabled: bool,
}

fn default_fetch_max_bytes() -> i64 {
    50 << 20
}

fn default_fetch_partition_max_bytes() -> i64 {
    1 << 20
}

fn default_topic_bootstrap() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_partition_max_bytes: default_fetch_partition_max_bytes(),
            topic_bootstrap_enabled: default_topic_bootstrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.fetch_max_bytes, 50 << 20);
        assert_eq!(config.fetch_partition_max_bytes, 1 << 20);
        assert!(config.topic_bootstrap_enabled);
    }

    #[test]
    fn deserializes_dotted_names_with_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"fetch.partition.max.bytes": 4096, "topic.bootstrap.enabled": false}"#,
        )
        .unwrap();
        assert_eq!(config.fetch_max_bytes, 50 << 20);
        assert_eq!(config.fetch_partition_max_bytes, 4096);
        assert!(!config.topic_bootstrap_enabled);
    }
}
