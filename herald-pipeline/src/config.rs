//! Producer and consumer pipeline configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use herald_broker::StartPosition;
use herald_core::{CloudEvent, CodecConfig};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Function deriving a record key from an envelope.
pub type KeyFn = Arc<dyn Fn(&CloudEvent) -> Option<Vec<u8>> + Send + Sync>;

/// How the producer derives the record key, and therefore the partition.
///
/// When the chosen attribute is absent the event id is used, so every record
/// carries a key.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    #[default]
    EventId,
    Subject,
    /// Value of the named extension attribute.
    Extension(String),
    #[serde(skip)]
    Custom(KeyFn),
}

impl PartitionKey {
    /// Key from an arbitrary function over the envelope.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CloudEvent) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn key_for(&self, event: &CloudEvent) -> Vec<u8> {
        let key = match self {
            Self::EventId => None,
            Self::Subject => event.subject().map(|s| s.as_bytes().to_vec()),
            Self::Extension(name) => event.extension(name).map(|v| v.as_bytes().to_vec()),
            Self::Custom(f) => f(event),
        };
        key.unwrap_or_else(|| event.id().as_bytes().to_vec())
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventId => write!(f, "EventId"),
            Self::Subject => write!(f, "Subject"),
            Self::Extension(name) => f.debug_tuple("Extension").field(name).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Configuration for a [`Producer`](crate::Producer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// CloudEvents `source` stamped on wrapped domain events.
    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub partition_key: PartitionKey,
}

fn default_source() -> String {
    "/herald".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            retry: RetryPolicy::default(),
            codec: CodecConfig::default(),
            partition_key: PartitionKey::default(),
        }
    }
}

impl ProducerConfig {
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_partition_key(mut self, key: PartitionKey) -> Self {
        self.partition_key = key;
        self
    }
}

/// What the consumer does with a record whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Retry up to the retry budget, then route to the dead-letter topic.
    #[default]
    RetryThenDeadLetter,
    /// Log the failure and move on without retrying.
    Skip,
}

/// Configuration for a [`ConsumerPipeline`](crate::ConsumerPipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group name (determines offset tracking).
    #[serde(default = "default_group")]
    pub group: String,

    /// Maximum records per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Where a group without committed offsets starts.
    #[serde(default)]
    pub start_position: StartPosition,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Handler retry budget and backoff.
    #[serde(default = "default_consumer_retry")]
    pub retry: RetryPolicy,

    /// Appended to the source topic to name its dead-letter topic.
    #[serde(default = "default_dead_letter_suffix")]
    pub dead_letter_suffix: String,

    /// Fixed dead-letter topic, overriding the suffix.
    #[serde(default)]
    pub dead_letter_topic: Option<String>,

    /// Records buffered per partition worker. Each partition is handled by a
    /// single task so records of a partition are processed one at a time.
    #[serde(default = "default_partition_buffer")]
    pub partition_buffer: usize,
}

fn default_group() -> String {
    "herald".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_consumer_retry() -> RetryPolicy {
    RetryPolicy::new(3)
        .with_initial_backoff(Duration::from_millis(50))
        .with_max_backoff(Duration::from_secs(5))
}

fn default_dead_letter_suffix() -> String {
    ".dlt".to_string()
}

fn default_partition_buffer() -> usize {
    256
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            batch_size: default_batch_size(),
            poll_timeout: default_poll_timeout(),
            start_position: StartPosition::default(),
            failure_policy: FailurePolicy::default(),
            retry: default_consumer_retry(),
            dead_letter_suffix: default_dead_letter_suffix(),
            dead_letter_topic: None,
            partition_buffer: default_partition_buffer(),
        }
    }
}

impl ConsumerConfig {
    /// Default configuration for `group`.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_start_position(mut self, start: StartPosition) -> Self {
        self.start_position = start;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Dead-letter topic for records consumed from `topic`.
    pub fn dead_letter_topic_for(&self, topic: &str) -> String {
        match &self.dead_letter_topic {
            Some(fixed) => fixed.clone(),
            None => format!("{topic}{}", self.dead_letter_suffix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::testing::EventFixture;

    #[test]
    fn consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.group, "herald");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.poll_timeout, Duration::from_millis(500));
        assert_eq!(config.start_position, StartPosition::Earliest);
        assert_eq!(config.failure_policy, FailurePolicy::RetryThenDeadLetter);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn dead_letter_topic_naming() {
        let config = ConsumerConfig::new("g");
        assert_eq!(config.dead_letter_topic_for("orders"), "orders.dlt");

        let config = config.with_dead_letter_topic("graveyard");
        assert_eq!(config.dead_letter_topic_for("orders"), "graveyard");
    }

    #[test]
    fn consumer_config_from_partial_json() {
        let json = r#"{"group": "billing", "poll_timeout": "2s", "failure_policy": "skip"}"#;
        let config: ConsumerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.group, "billing");
        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.failure_policy, FailurePolicy::Skip);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn partition_key_defaults_to_event_id() {
        let event = EventFixture::new("e1").build();
        assert_eq!(PartitionKey::default().key_for(&event), b"e1");
    }

    #[test]
    fn partition_key_from_extension_falls_back_to_id() {
        let event = EventFixture::new("e1").extension("customer", "c42").build();
        let by_customer = PartitionKey::Extension("customer".into());
        assert_eq!(by_customer.key_for(&event), b"c42");

        let by_region = PartitionKey::Extension("region".into());
        assert_eq!(by_region.key_for(&event), b"e1");
    }

    #[test]
    fn partition_key_custom_function() {
        let event = EventFixture::new("e1").build();
        let key = PartitionKey::custom(|e| Some(e.ty().as_bytes().to_vec()));
        assert_eq!(key.key_for(&event), b"order.created");
    }

    #[test]
    fn partition_key_deserializes() {
        let key: PartitionKey = serde_json::from_str(r#"{"extension": "tenant"}"#).unwrap();
        assert!(matches!(key, PartitionKey::Extension(name) if name == "tenant"));
        let key: PartitionKey = serde_json::from_str(r#""subject""#).unwrap();
        assert!(matches!(key, PartitionKey::Subject));
    }
}
