use std::time::Duration;

use herald_broker::{BrokerConfig, BrokerKind, StartPosition};
use herald_core::Encoding;
use herald_pipeline::{ConsumerConfig, FailurePolicy, PartitionKey, ProducerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Topic used by `send`, `listen` and `demo` unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "main-topic";

/// Delay between two records of the periodic sender.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(5);

/// Partition count requested when the sender declares its topic.
pub const DEFAULT_TOPIC_PARTITIONS: u32 = 3;

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawHeraldConfig {
    #[serde(default)]
    pub broker: RawBrokerSection,

    #[serde(default)]
    pub topic: RawTopicSection,

    #[serde(default)]
    pub producer: RawProducerSection,

    #[serde(default)]
    pub consumer: RawConsumerSection,

    #[serde(default)]
    pub sender: RawSenderSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawBrokerSection {
    pub kind: Option<BrokerKind>,
    pub brokers: Option<Vec<String>>,
    pub client_id: Option<String>,
    pub default_partitions: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub send_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTopicSection {
    pub name: Option<String>,
    pub partitions: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawProducerSection {
    pub source: Option<String>,
    pub encoding: Option<Encoding>,
    pub partition_key: Option<PartitionKey>,
    /// Replaces the whole retry policy; unset fields take policy defaults.
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConsumerSection {
    pub group: Option<String>,
    pub start_position: Option<StartPosition>,
    pub failure_policy: Option<FailurePolicy>,
    pub batch_size: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    pub poll_timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub dead_letter_topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSenderSection {
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize)]
pub struct HeraldConfig {
    pub broker: BrokerConfig,
    pub topic: TopicConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicConfig {
    pub name: String,
    pub partitions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_config_parses_partial_sections() {
        let raw: RawHeraldConfig = toml::from_str(
            r#"
[broker]
kind = "kafka"
brokers = ["kafka-0:9092"]

[consumer]
poll_timeout = "250ms"
failure_policy = "skip"

[sender]
interval = "1s"
"#,
        )
        .unwrap();

        assert_eq!(raw.broker.kind, Some(BrokerKind::Kafka));
        assert_eq!(raw.broker.brokers, Some(vec!["kafka-0:9092".to_string()]));
        assert!(raw.broker.client_id.is_none());
        assert_eq!(raw.consumer.poll_timeout, Some(Duration::from_millis(250)));
        assert_eq!(raw.consumer.failure_policy, Some(FailurePolicy::Skip));
        assert_eq!(raw.sender.interval, Some(Duration::from_secs(1)));
        assert!(raw.topic.name.is_none());
    }

    #[test]
    fn test_raw_config_parses_retry_and_key() {
        let raw: RawHeraldConfig = toml::from_str(
            r#"
[producer]
encoding = "structured"
partition_key = { extension = "name" }

[producer.retry]
max_attempts = 2
"#,
        )
        .unwrap();

        assert_eq!(raw.producer.encoding, Some(Encoding::Structured));
        assert!(matches!(
            raw.producer.partition_key,
            Some(PartitionKey::Extension(ref name)) if name == "name"
        ));
        let retry = raw.producer.retry.unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
    }
}
