//! Partitioned in-memory broker for tests and local runs.
//!
//! Mirrors the parts of Kafka the pipeline relies on:
//! - keyed records land on `murmur2(key) % partitions`, unkeyed ones rotate
//! - offsets are partition-local and start at zero
//! - committed offsets are stored per consumer group and survive the consumer
//!
//! Every consumer of a group is assigned all partitions; there is no
//! rebalancing between members.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::WireMessage;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::partitioner::partition_for_key;
use crate::traits::{
    Broker, BrokerConsumer, ConsumerRecord, DeliveryAck, Offset, Partition, RecordBatch,
    StartPosition, TopicPartition,
};

/// Partition count used by [`InMemoryBroker::new`].
pub const DEFAULT_PARTITIONS: u32 = 8;

#[derive(Debug, Clone)]
struct StoredRecord {
    timestamp: DateTime<Utc>,
    message: WireMessage,
}

type PartitionLog = Vec<StoredRecord>;

/// Shared state between the broker handle and its consumers.
struct SharedState {
    topics: RwLock<HashMap<String, Vec<PartitionLog>>>,
    /// Committed next-offsets keyed by (group, partition).
    offsets: RwLock<HashMap<(String, TopicPartition), Offset>>,
    notify: Notify,
    round_robin: AtomicU32,
    failing_sends: AtomicU32,
    default_partitions: u32,
}

/// In-memory implementation of [`Broker`].
///
/// Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<SharedState>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_partitions(DEFAULT_PARTITIONS)
    }

    /// Broker whose auto-created topics get `partitions` partitions.
    #[must_use]
    pub fn with_default_partitions(partitions: u32) -> Self {
        Self {
            shared: Arc::new(SharedState {
                topics: RwLock::new(HashMap::new()),
                offsets: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                round_robin: AtomicU32::new(0),
                failing_sends: AtomicU32::new(0),
                default_partitions: partitions.max(1),
            }),
        }
    }

    /// Make the next `count` sends fail with a retryable error.
    pub fn fail_next_sends(&self, count: u32) {
        self.shared.failing_sends.store(count, Ordering::SeqCst);
    }

    /// All records of a topic, partition by partition in offset order.
    pub async fn records(&self, topic: &str) -> Vec<ConsumerRecord> {
        let topics = self.shared.topics.read().await;
        let Some(partitions) = topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, stored)| ConsumerRecord {
                    topic: topic.to_string(),
                    partition: partition as Partition,
                    offset: offset as Offset,
                    timestamp: stored.timestamp,
                    message: stored.message.clone(),
                })
            })
            .collect()
    }

    /// Committed next-offset of `group` on a partition.
    pub async fn committed_offset(&self, group: &str, partition: &TopicPartition) -> Option<Offset> {
        let offsets = self.shared.offsets.read().await;
        offsets.get(&(group.to_string(), partition.clone())).copied()
    }

    /// Number of partitions of `topic`, if it exists.
    pub async fn partition_count(&self, topic: &str) -> Option<u32> {
        let topics = self.shared.topics.read().await;
        topics.get(topic).map(|p| p.len() as u32)
    }

    /// Number of records currently stored for a topic.
    pub async fn record_count(&self, topic: &str) -> usize {
        let topics = self.shared.topics.read().await;
        topics
            .get(topic)
            .map(|p| p.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    async fn create_topic(&self, topic: &str, partitions: u32) -> u32 {
        let mut topics = self.shared.topics.write().await;
        let logs = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, partitions, "Creating in-memory topic");
            vec![Vec::new(); partitions.max(1) as usize]
        });
        logs.len() as u32
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<()> {
        self.create_topic(topic, partitions).await;
        Ok(())
    }

    async fn send(&self, topic: &str, message: WireMessage) -> Result<DeliveryAck> {
        let injected = self
            .shared
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::Send(format!("injected failure sending to {topic}")));
        }

        self.create_topic(topic, self.shared.default_partitions).await;

        let mut topics = self.shared.topics.write().await;
        let logs = topics
            .get_mut(topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        let count = logs.len() as u32;
        let partition = match &message.key {
            Some(key) => partition_for_key(key, count),
            None => self.shared.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        };

        let log = &mut logs[partition as usize];
        let offset = log.len() as Offset;
        log.push(StoredRecord {
            timestamp: Utc::now(),
            message,
        });
        drop(topics);

        self.shared.notify.notify_waiters();
        Ok(DeliveryAck {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Box<dyn BrokerConsumer>> {
        let count = self.create_topic(topic, self.shared.default_partitions).await;

        let mut positions = Vec::with_capacity(count as usize);
        {
            let topics = self.shared.topics.read().await;
            let offsets = self.shared.offsets.read().await;
            for partition in 0..count {
                let tp = TopicPartition::new(topic, partition);
                let position = match offsets.get(&(group.to_string(), tp)) {
                    Some(committed) => *committed,
                    None => match start {
                        StartPosition::Earliest => 0,
                        StartPosition::Latest => topics
                            .get(topic)
                            .and_then(|logs| logs.get(partition as usize))
                            .map_or(0, |log| log.len() as Offset),
                    },
                };
                positions.push(position);
            }
        }

        debug!(topic, group, partitions = count, "In-memory consumer joined group");
        Ok(Box::new(InMemoryConsumer {
            topic: topic.to_string(),
            group: group.to_string(),
            shared: Arc::clone(&self.shared),
            positions: Mutex::new(positions),
            next_partition: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Consumer handle over an [`InMemoryBroker`] topic.
struct InMemoryConsumer {
    topic: String,
    group: String,
    shared: Arc<SharedState>,
    /// Fetch position per partition.
    positions: Mutex<Vec<Offset>>,
    /// Partition the next poll starts from, so a busy partition cannot starve
    /// the others.
    next_partition: AtomicU32,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    async fn fetch(&self, max_records: usize) -> Vec<ConsumerRecord> {
        let topics = self.shared.topics.read().await;
        let Some(logs) = topics.get(&self.topic) else {
            return Vec::new();
        };
        let mut positions = self.positions.lock().await;
        let count = positions.len();
        if count == 0 {
            return Vec::new();
        }

        let first = self.next_partition.fetch_add(1, Ordering::Relaxed) as usize % count;
        let mut records = Vec::new();
        for step in 0..count {
            let partition = (first + step) % count;
            let Some(log) = logs.get(partition) else {
                continue;
            };
            let position = &mut positions[partition];
            while records.len() < max_records && (*position as usize) < log.len() {
                let stored = &log[*position as usize];
                records.push(ConsumerRecord {
                    topic: self.topic.clone(),
                    partition: partition as Partition,
                    offset: *position,
                    timestamp: stored.timestamp,
                    message: stored.message.clone(),
                });
                *position += 1;
            }
            if records.len() >= max_records {
                break;
            }
        }
        records
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<RecordBatch> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }

            // Register interest before reading so a send between the read and
            // the wait is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.fetch(max_records.max(1)).await;
            if !records.is_empty() {
                return Ok(RecordBatch::new(records));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(RecordBatch::empty());
            }
        }
    }

    async fn commit(&self, partition: &TopicPartition, next_offset: Offset) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if partition.topic != self.topic {
            return Err(Error::Commit(format!(
                "{partition} is not assigned to this consumer"
            )));
        }
        let mut offsets = self.shared.offsets.write().await;
        offsets.insert((self.group.clone(), partition.clone()), next_offset);
        Ok(())
    }

    async fn committed(&self, partition: &TopicPartition) -> Result<Option<Offset>> {
        let offsets = self.shared.offsets.read().await;
        Ok(offsets
            .get(&(self.group.clone(), partition.clone()))
            .copied())
    }

    fn group(&self) -> &str {
        &self.group
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
