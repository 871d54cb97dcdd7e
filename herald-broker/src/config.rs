//! Configuration for broker connections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which broker implementation to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// Process-local partitioned log. Nothing survives a restart.
    #[default]
    Memory,
    /// Apache Kafka (requires the `kafka` feature).
    Kafka,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    /// Bootstrap servers, e.g. `["localhost:9092"]`.
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Client id reported to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Partition count for topics created on first use.
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,

    /// Time the broker has to acknowledge a single send.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Consumer session timeout before the group rebalances.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "herald".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            brokers: default_brokers(),
            client_id: default_client_id(),
            default_partitions: default_partitions(),
            send_timeout: default_send_timeout(),
            session_timeout: default_session_timeout(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn with_kind(mut self, kind: BrokerKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_default_partitions(mut self, partitions: u32) -> Self {
        self.default_partitions = partitions;
        self
    }

    /// Bootstrap servers as a comma-separated list (librdkafka format).
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_values() {
        let config = BrokerConfig::default();

        assert_eq!(config.kind, BrokerKind::Memory);
        assert_eq!(config.brokers, vec!["localhost:9092"]);
        assert_eq!(config.default_partitions, 8);
        assert_eq!(config.send_timeout, Duration::from_secs(30));
    }

    #[test]
    fn config_builder_pattern() {
        let config = BrokerConfig::default()
            .with_kind(BrokerKind::Kafka)
            .with_brokers(["kafka-0:9092", "kafka-1:9092"])
            .with_default_partitions(3);

        assert_eq!(config.kind, BrokerKind::Kafka);
        assert_eq!(config.bootstrap_servers(), "kafka-0:9092,kafka-1:9092");
        assert_eq!(config.default_partitions, 3);
    }

    #[test]
    fn config_deserializes_humantime_durations() {
        let json = r#"{"kind": "kafka", "send_timeout": "5s", "session_timeout": "1m"}"#;
        let config: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, BrokerKind::Kafka);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.client_id, "herald");
    }
}
