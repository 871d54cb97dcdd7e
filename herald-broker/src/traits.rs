//! Core traits for broker operations.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::WireMessage;
use serde::{Deserialize, Serialize};

/// Position within a single partition.
pub type Offset = u64;

/// Partition index within a topic.
pub type Partition = u32;

/// A single partition of a topic: the unit of ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: Partition,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: Partition) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Where a consumer group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// From the beginning of each partition.
    #[default]
    Earliest,
    /// Only records produced after subscribing.
    Latest,
}

/// Broker acknowledgment of a sent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
}

/// A record fetched from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    pub timestamp: DateTime<Utc>,
    pub message: WireMessage,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A batch of records returned from polling.
///
/// Records of the same partition appear in offset order.
#[derive(Debug, Default)]
pub struct RecordBatch {
    records: Vec<ConsumerRecord>,
}

impl RecordBatch {
    pub fn new(records: Vec<ConsumerRecord>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerRecord> {
        self.records.iter()
    }
}

impl IntoIterator for RecordBatch {
    type Item = ConsumerRecord;
    type IntoIter = std::vec::IntoIter<ConsumerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// A connection to a message broker, shared by producers and consumers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the topic if it does not exist yet.
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> crate::Result<()>;

    /// Send one record and wait for the broker's acknowledgment.
    ///
    /// Records with a key are placed by key hash; records without a key are
    /// spread across partitions.
    async fn send(&self, topic: &str, message: WireMessage) -> crate::Result<DeliveryAck>;

    /// Join `group` and start consuming `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartPosition,
    ) -> crate::Result<Box<dyn BrokerConsumer>>;
}

/// A consumer group member. Methods take `&self` so that per-partition workers
/// can commit while the fetch loop keeps polling.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Fetch up to `max_records`, waiting at most `timeout` when nothing is
    /// available. An empty batch means the timeout elapsed.
    async fn poll(&self, max_records: usize, timeout: Duration) -> crate::Result<RecordBatch>;

    /// Commit progress for one partition. `next_offset` is the offset of the
    /// next record to consume, i.e. the last processed offset plus one.
    async fn commit(&self, partition: &TopicPartition, next_offset: Offset) -> crate::Result<()>;

    /// Last committed position of a partition for this group.
    async fn committed(&self, partition: &TopicPartition) -> crate::Result<Option<Offset>>;

    /// Consumer group name.
    fn group(&self) -> &str;

    /// Leave the group and release the connection.
    async fn close(&self) -> crate::Result<()>;
}
