use super::types::{
    DEFAULT_SEND_INTERVAL, DEFAULT_TOPIC, DEFAULT_TOPIC_PARTITIONS, HeraldConfig,
    RawBrokerSection, RawConsumerSection, RawHeraldConfig, RawProducerSection, RawSenderSection,
    RawTopicSection, SenderConfig, TopicConfig,
};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use herald_broker::BrokerConfig;
use herald_core::CodecConfig;
use herald_pipeline::{ConsumerConfig, ProducerConfig};
use std::path::{Path, PathBuf};

/// Env var naming the project config file.
pub const CONFIG_ENV_VAR: &str = "HERALD_CONFIG";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration: user config, then project config (or
    /// `explicit` when given), then `overrides` from the command line.
    pub fn load(explicit: Option<&Path>, overrides: RawHeraldConfig) -> Result<HeraldConfig> {
        let mut layers = Vec::new();
        if let Some(user_path) = Self::user_config_path() {
            layers.push(user_path);
        }
        match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                layers.push(path.to_path_buf());
            }
            None => layers.push(Self::project_config_path()),
        }
        Self::load_layers(&layers, overrides)
    }

    /// Merge the files in `paths` that exist, in order, then `overrides`.
    pub fn load_layers(paths: &[PathBuf], overrides: RawHeraldConfig) -> Result<HeraldConfig> {
        let mut raw = RawHeraldConfig::default();
        for path in paths {
            if path.exists() {
                raw = Self::merge_raw(raw, Self::read(path)?);
            }
        }
        raw = Self::merge_raw(raw, overrides);
        Ok(Self::finalize(raw))
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "herald").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with the HERALD_CONFIG env var
    pub fn project_config_path() -> PathBuf {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from("herald.toml"),
        }
    }

    fn read(path: &Path) -> Result<RawHeraldConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    pub(crate) fn merge_raw(base: RawHeraldConfig, overlay: RawHeraldConfig) -> RawHeraldConfig {
        RawHeraldConfig {
            broker: RawBrokerSection {
                kind: overlay.broker.kind.or(base.broker.kind),
                brokers: overlay.broker.brokers.or(base.broker.brokers),
                client_id: overlay.broker.client_id.or(base.broker.client_id),
                default_partitions: overlay
                    .broker
                    .default_partitions
                    .or(base.broker.default_partitions),
                send_timeout: overlay.broker.send_timeout.or(base.broker.send_timeout),
            },
            topic: RawTopicSection {
                name: overlay.topic.name.or(base.topic.name),
                partitions: overlay.topic.partitions.or(base.topic.partitions),
            },
            producer: RawProducerSection {
                source: overlay.producer.source.or(base.producer.source),
                encoding: overlay.producer.encoding.or(base.producer.encoding),
                partition_key: overlay.producer.partition_key.or(base.producer.partition_key),
                retry: overlay.producer.retry.or(base.producer.retry),
            },
            consumer: RawConsumerSection {
                group: overlay.consumer.group.or(base.consumer.group),
                start_position: overlay
                    .consumer
                    .start_position
                    .or(base.consumer.start_position),
                failure_policy: overlay
                    .consumer
                    .failure_policy
                    .or(base.consumer.failure_policy),
                batch_size: overlay.consumer.batch_size.or(base.consumer.batch_size),
                poll_timeout: overlay.consumer.poll_timeout.or(base.consumer.poll_timeout),
                retry: overlay.consumer.retry.or(base.consumer.retry),
                dead_letter_topic: overlay
                    .consumer
                    .dead_letter_topic
                    .or(base.consumer.dead_letter_topic),
            },
            sender: RawSenderSection {
                interval: overlay.sender.interval.or(base.sender.interval),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawHeraldConfig) -> HeraldConfig {
        let mut broker = BrokerConfig::default();
        if let Some(kind) = raw.broker.kind {
            broker.kind = kind;
        }
        if let Some(brokers) = raw.broker.brokers {
            broker.brokers = brokers;
        }
        if let Some(client_id) = raw.broker.client_id {
            broker.client_id = client_id;
        }
        if let Some(partitions) = raw.broker.default_partitions {
            broker.default_partitions = partitions;
        }
        if let Some(timeout) = raw.broker.send_timeout {
            broker.send_timeout = timeout;
        }

        let mut producer = ProducerConfig::default();
        if let Some(source) = raw.producer.source {
            producer.source = source;
        }
        if let Some(encoding) = raw.producer.encoding {
            producer.codec = CodecConfig::default().with_encoding(encoding);
        }
        if let Some(key) = raw.producer.partition_key {
            producer.partition_key = key;
        }
        if let Some(retry) = raw.producer.retry {
            producer.retry = retry;
        }

        let mut consumer = ConsumerConfig::default();
        if let Some(group) = raw.consumer.group {
            consumer.group = group;
        }
        if let Some(start) = raw.consumer.start_position {
            consumer.start_position = start;
        }
        if let Some(policy) = raw.consumer.failure_policy {
            consumer.failure_policy = policy;
        }
        if let Some(size) = raw.consumer.batch_size {
            consumer.batch_size = size;
        }
        if let Some(timeout) = raw.consumer.poll_timeout {
            consumer.poll_timeout = timeout;
        }
        if let Some(retry) = raw.consumer.retry {
            consumer.retry = retry;
        }
        consumer.dead_letter_topic = raw.consumer.dead_letter_topic;

        HeraldConfig {
            broker,
            topic: TopicConfig {
                name: raw.topic.name.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                partitions: raw.topic.partitions.unwrap_or(DEFAULT_TOPIC_PARTITIONS),
            },
            producer,
            consumer,
            sender: SenderConfig {
                interval: raw.sender.interval.unwrap_or(DEFAULT_SEND_INTERVAL),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_broker::{BrokerKind, StartPosition};
    use herald_core::Encoding;
    use herald_pipeline::FailurePolicy;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{contents}").unwrap();
        path
    }

    #[test]
    fn test_no_files_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");

        let config = ConfigLoader::load_layers(&[missing], RawHeraldConfig::default()).unwrap();

        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.topic.name, DEFAULT_TOPIC);
        assert_eq!(config.sender.interval, Duration::from_secs(5));
        assert_eq!(config.consumer.group, "herald");
        assert_eq!(config.consumer.start_position, StartPosition::Earliest);
        assert_eq!(config.producer.retry.max_attempts, 5);
    }

    #[test]
    fn test_project_layer_overrides_user_layer() {
        let temp_dir = TempDir::new().unwrap();
        let user = write(
            &temp_dir,
            "user.toml",
            r#"
[broker]
kind = "kafka"
brokers = ["user-kafka:9092"]

[consumer]
group = "user-group"
batch_size = 10
"#,
        );
        let project = write(
            &temp_dir,
            "project.toml",
            r#"
[consumer]
group = "project-group"
"#,
        );

        let config =
            ConfigLoader::load_layers(&[user, project], RawHeraldConfig::default()).unwrap();

        assert_eq!(config.broker.kind, BrokerKind::Kafka);
        assert_eq!(config.broker.brokers, vec!["user-kafka:9092"]);
        assert_eq!(config.consumer.group, "project-group");
        // Not set in the project layer, so the user value survives.
        assert_eq!(config.consumer.batch_size, 10);
    }

    #[test]
    fn test_overrides_win_over_files() {
        let temp_dir = TempDir::new().unwrap();
        let project = write(
            &temp_dir,
            "herald.toml",
            r#"
[topic]
name = "orders"

[sender]
interval = "10s"
"#,
        );
        let mut overrides = RawHeraldConfig::default();
        overrides.topic.name = Some("payments".to_string());

        let config = ConfigLoader::load_layers(&[project], overrides).unwrap();

        assert_eq!(config.topic.name, "payments");
        assert_eq!(config.sender.interval, Duration::from_secs(10));
    }

    #[test]
    fn test_finalize_maps_sections_onto_library_configs() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(
            &temp_dir,
            "herald.toml",
            r#"
[producer]
source = "/billing"
encoding = "structured"

[consumer]
failure_policy = "skip"
start_position = "latest"
dead_letter_topic = "graveyard"
"#,
        );

        let config = ConfigLoader::load_layers(&[path], RawHeraldConfig::default()).unwrap();

        assert_eq!(config.producer.source, "/billing");
        assert_eq!(config.producer.codec.encoding, Encoding::Structured);
        assert_eq!(config.consumer.failure_policy, FailurePolicy::Skip);
        assert_eq!(config.consumer.start_position, StartPosition::Latest);
        assert_eq!(config.consumer.dead_letter_topic_for("orders"), "graveyard");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(&temp_dir, "invalid.toml", "this is not valid toml {{{{");

        let result = ConfigLoader::load_layers(&[path], RawHeraldConfig::default());
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("invalid.toml"));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");

        let result = ConfigLoader::load(Some(missing.as_path()), RawHeraldConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_effective_config_serializes_to_toml() {
        let config = ConfigLoader::load_layers(&[], RawHeraldConfig::default()).unwrap();
        let rendered = toml::to_string_pretty(&config).unwrap();

        assert!(rendered.contains("[broker]"));
        assert!(rendered.contains("name = \"main-topic\""));
        assert!(rendered.contains("interval = \"5s\""));
    }

    #[test]
    fn test_user_config_path_mentions_herald() {
        if let Some(path) = ConfigLoader::user_config_path() {
            assert!(path.to_string_lossy().contains("herald"));
            assert!(path.ends_with("config.toml"));
        }
    }
}
