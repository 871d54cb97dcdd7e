//! Kafka-backed [`Broker`] built on librdkafka.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{Headers, WireMessage};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset as KafkaOffset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::traits::{
    Broker, BrokerConsumer, ConsumerRecord, DeliveryAck, Offset, Partition, RecordBatch,
    StartPosition, TopicPartition,
};

/// Broker connected to a Kafka cluster.
pub struct KafkaBroker {
    config: BrokerConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaBroker {
    /// Create producer and admin clients. librdkafka connects lazily, so this
    /// only fails on invalid configuration.
    pub fn connect(config: BrokerConfig) -> Result<Self> {
        let bootstrap = config.bootstrap_servers();

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                config.send_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| Error::Connection(e.to_string()))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .set("client.id", &config.client_id)
            .create()
            .map_err(|e| Error::Connection(e.to_string()))?;

        info!(brokers = %bootstrap, "Connected Kafka clients");
        Ok(Self {
            config,
            producer,
            admin,
        })
    }
}

fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}

fn to_record(message: &BorrowedMessage<'_>) -> ConsumerRecord {
    let mut headers = Headers::new();
    if let Some(kafka_headers) = message.headers() {
        for i in 0..kafka_headers.count() {
            let header = kafka_headers.get(i);
            headers.append(header.key, header.value.unwrap_or_default());
        }
    }

    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    ConsumerRecord {
        topic: message.topic().to_string(),
        partition: message.partition() as Partition,
        offset: message.offset() as Offset,
        timestamp,
        message: WireMessage {
            key: message.key().map(<[u8]>::to_vec),
            headers,
            payload: message.payload().map(<[u8]>::to_vec),
        },
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<()> {
        let new_topic = NewTopic::new(topic, partitions as i32, TopicReplication::Fixed(1));
        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, partitions, "Created topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists");
                }
                Err((name, code)) => {
                    return Err(Error::Connection(format!(
                        "failed to create topic {name}: {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn send(&self, topic: &str, message: WireMessage) -> Result<DeliveryAck> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic);
        record.key = message.key.as_deref();
        record.payload = message.payload.as_deref();
        if !message.headers.is_empty() {
            record = record.headers(to_kafka_headers(&message.headers));
        }

        let (partition, offset) = self
            .producer
            .send(record, self.config.send_timeout)
            .await
            .map_err(|(err, _)| Error::Send(format!("{topic}: {err}")))?;

        Ok(DeliveryAck {
            topic: topic.to_string(),
            partition: partition as Partition,
            offset: offset as Offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Box<dyn BrokerConsumer>> {
        let reset = match start {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        };
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .set(
                "session.timeout.ms",
                self.config.session_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| Error::Connection(e.to_string()))?;

        consumer.subscribe(&[topic])?;
        info!(topic, group, auto_offset_reset = reset, "Kafka consumer subscribed");

        Ok(Box::new(KafkaConsumer {
            group: group.to_string(),
            consumer,
            timeout: self.config.session_timeout,
        }))
    }
}

struct KafkaConsumer {
    group: String,
    consumer: StreamConsumer,
    /// Bound on blocking metadata calls.
    timeout: Duration,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<RecordBatch> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut records = Vec::new();

        while records.len() < max_records.max(1) {
            // After the first record only drain what is already buffered.
            let wait_until = if records.is_empty() {
                deadline
            } else {
                tokio::time::Instant::now()
            };
            match tokio::time::timeout_at(wait_until, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(to_record(&message)),
                Ok(Err(err)) if records.is_empty() => return Err(Error::Poll(err.to_string())),
                Ok(Err(err)) => {
                    warn!(error = %err, "Kafka poll error after partial batch");
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(RecordBatch::new(records))
    }

    async fn commit(&self, partition: &TopicPartition, next_offset: Offset) -> Result<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            &partition.topic,
            partition.partition as i32,
            KafkaOffset::Offset(next_offset as i64),
        )?;
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| Error::Commit(format!("{partition}: {e}")))
    }

    async fn committed(&self, partition: &TopicPartition) -> Result<Option<Offset>> {
        let mut list = TopicPartitionList::new();
        list.add_partition(&partition.topic, partition.partition as i32);
        let list = self.consumer.committed_offsets(list, self.timeout)?;
        Ok(list
            .find_partition(&partition.topic, partition.partition as i32)
            .and_then(|elem| match elem.offset() {
                KafkaOffset::Offset(offset) if offset >= 0 => Some(offset as Offset),
                _ => None,
            }))
    }

    fn group(&self) -> &str {
        &self.group
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        debug!(group = %self.group, "Kafka consumer left group");
        Ok(())
    }
}
