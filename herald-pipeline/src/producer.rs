//! Producer pipeline: wrap, encode, key and deliver events with retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use herald_broker::{Broker, Offset, Partition};
use herald_core::{CloudEvent, Codec, DomainEvent, EnvelopeFactory};
use tracing::{debug, info, warn};

use crate::config::ProducerConfig;
use crate::error::PublishError;

/// Progress of a single publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Acked,
    /// The retry budget ran out; see [`PublishError::delivery_record`].
    Failed,
}

/// Correlates an outbound event with its broker acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub event_id: String,
    pub topic: String,
    pub partition: Option<Partition>,
    pub offset: Option<Offset>,
    /// Send attempts made so far.
    pub attempts: u32,
    pub status: DeliveryStatus,
}

type InFlight = Arc<Mutex<HashMap<u64, DeliveryRecord>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<u64, DeliveryRecord>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a publish from the in-flight table when it completes or its
/// future is dropped.
struct InFlightGuard {
    table: InFlight,
    ticket: u64,
}

impl InFlightGuard {
    fn record_attempt(&self, attempts: u32) {
        if let Some(record) = lock(&self.table).get_mut(&self.ticket) {
            record.attempts = attempts;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.ticket);
    }
}

/// Publishes CloudEvents to a broker with at-least-once delivery.
///
/// Each call suspends until the broker acknowledges the record or the retry
/// budget is exhausted. Independent publishes run concurrently.
pub struct Producer {
    broker: Arc<dyn Broker>,
    codec: Codec,
    factory: EnvelopeFactory,
    config: ProducerConfig,
    in_flight: InFlight,
    next_ticket: AtomicU64,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, config: ProducerConfig) -> Self {
        info!(
            source = %config.source,
            encoding = ?config.codec.encoding,
            max_attempts = config.retry.max_attempts,
            "Producer created"
        );
        Self {
            broker,
            codec: Codec::new(&config.codec),
            factory: EnvelopeFactory::new(config.source.as_str()),
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Replace the envelope factory, e.g. with seeded ids and a fixed clock.
    #[must_use]
    pub fn with_factory(mut self, factory: EnvelopeFactory) -> Self {
        self.factory = factory;
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn factory(&self) -> &EnvelopeFactory {
        &self.factory
    }

    /// Wrap a domain event in a CloudEvent and publish it to `topic`.
    pub async fn publish<E>(&self, topic: &str, event: &E) -> Result<DeliveryRecord, PublishError>
    where
        E: DomainEvent + ?Sized,
    {
        let envelope = self.factory.wrap(event)?;
        self.publish_event(topic, &envelope).await
    }

    /// Publish each event, concurrently. Results are in input order.
    pub async fn publish_batch<E>(
        &self,
        topic: &str,
        events: &[E],
    ) -> Vec<Result<DeliveryRecord, PublishError>>
    where
        E: DomainEvent,
    {
        join_all(events.iter().map(|event| self.publish(topic, event))).await
    }

    /// Publish an already built envelope.
    pub async fn publish_event(
        &self,
        topic: &str,
        event: &CloudEvent,
    ) -> Result<DeliveryRecord, PublishError> {
        let mut message = self.codec.encode(event)?;
        message.key = Some(self.config.partition_key.key_for(event));

        let guard = self.track(event.id(), topic);
        let retry = &self.config.retry;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            guard.record_attempt(attempts);

            match self.broker.send(topic, message.clone()).await {
                Ok(ack) => {
                    debug!(
                        event_id = %event.id(),
                        topic,
                        partition = ack.partition,
                        offset = ack.offset,
                        attempts,
                        "Event delivered"
                    );
                    return Ok(DeliveryRecord {
                        event_id: event.id().to_string(),
                        topic: ack.topic,
                        partition: Some(ack.partition),
                        offset: Some(ack.offset),
                        attempts,
                        status: DeliveryStatus::Acked,
                    });
                }
                Err(e) if e.is_retryable() && retry.allows_retry(attempts) => {
                    let delay = retry.delay_for(attempts);
                    warn!(
                        event_id = %event.id(),
                        topic,
                        attempt = attempts,
                        error = %e,
                        ?delay,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id(),
                        topic,
                        attempts,
                        error = %e,
                        "Delivery failed"
                    );
                    return Err(PublishError::DeliveryFailed {
                        event_id: event.id().to_string(),
                        topic: topic.to_string(),
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }

    /// Publishes still waiting for an acknowledgment.
    pub fn in_flight(&self) -> Vec<DeliveryRecord> {
        lock(&self.in_flight).values().cloned().collect()
    }

    fn track(&self, event_id: &str, topic: &str) -> InFlightGuard {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        lock(&self.in_flight).insert(
            ticket,
            DeliveryRecord {
                event_id: event_id.to_string(),
                topic: topic.to_string(),
                partition: None,
                offset: None,
                attempts: 0,
                status: DeliveryStatus::Pending,
            },
        );
        InFlightGuard {
            table: Arc::clone(&self.in_flight),
            ticket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionKey;
    use crate::retry::RetryPolicy;
    use herald_broker::{InMemoryBroker, partition_for_key};
    use herald_core::testing::{EventFixture, SampleOrder, deterministic_factory};
    use herald_core::{Codec, Encoding};

    fn producer(broker: &InMemoryBroker, attempts: u32) -> Producer {
        let config = ProducerConfig::default().with_retry(RetryPolicy::immediate(attempts));
        Producer::new(Arc::new(broker.clone()), config).with_factory(deterministic_factory(7))
    }

    #[tokio::test]
    async fn publish_wraps_and_delivers() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker, 5);

        let record = producer
            .publish("orders", &SampleOrder::new("e1"))
            .await
            .unwrap();
        assert_eq!(record.event_id, "e1");
        assert_eq!(record.status, DeliveryStatus::Acked);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.partition, Some(partition_for_key(b"e1", 8)));

        let stored = broker.records("orders").await;
        assert_eq!(stored.len(), 1);
        let event = Codec::default().decode(&stored[0].message).unwrap();
        assert_eq!(event.id(), "e1");
        assert_eq!(event.ty(), "order.created");
        assert_eq!(event.extension("customer"), Some("Ada Lovelace"));
        assert!(producer.in_flight().is_empty());
    }

    #[tokio::test]
    async fn retries_transient_failures_and_acks_once() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(2);
        let producer = producer(&broker, 5);

        let record = producer
            .publish_event("orders", &EventFixture::new("e1").build())
            .await
            .unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(broker.record_count("orders").await, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_last_cause() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(10);
        let producer = producer(&broker, 3);

        let err = producer
            .publish_event("orders", &EventFixture::new("e1").build())
            .await
            .unwrap_err();
        let record = err.delivery_record().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.topic, "orders");
        assert_eq!(record.offset, None);
        match err {
            PublishError::DeliveryFailed {
                event_id,
                attempts,
                source,
                ..
            } => {
                assert_eq!(event_id, "e1");
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("injected failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.record_count("orders").await, 0);
        assert!(producer.in_flight().is_empty());
    }

    #[tokio::test]
    async fn partition_key_from_extension() {
        let broker = InMemoryBroker::new();
        let config = ProducerConfig::default()
            .with_partition_key(PartitionKey::Extension("customer".into()));
        let producer = Producer::new(Arc::new(broker.clone()), config);

        let record = producer
            .publish("orders", &SampleOrder::new("e1"))
            .await
            .unwrap();
        assert_eq!(record.partition, Some(partition_for_key(b"Ada Lovelace", 8)));
        let stored = broker.records("orders").await;
        assert_eq!(stored[0].message.key.as_deref(), Some(&b"Ada Lovelace"[..]));
    }

    #[tokio::test]
    async fn batch_results_follow_input_order() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker, 5);
        let orders = vec![SampleOrder::new("a"), SampleOrder::new("b"), SampleOrder::new("c")];

        let results = producer.publish_batch("orders", &orders).await;
        let ids: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().event_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(broker.record_count("orders").await, 3);
    }

    #[tokio::test]
    async fn unregistered_content_type_is_a_serialization_error() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker, 5);
        let event = CloudEvent::builder()
            .id("e1")
            .source("/orders")
            .ty("order.created")
            .data("application/x-custom", b"raw".to_vec())
            .build()
            .unwrap();

        let err = producer.publish_event("orders", &event).await.unwrap_err();
        assert!(matches!(err, PublishError::Serialization(_)));
        assert!(err.delivery_record().is_none());
        assert_eq!(broker.record_count("orders").await, 0);
    }

    #[tokio::test]
    async fn structured_mode_producer() {
        let broker = InMemoryBroker::new();
        let config = ProducerConfig::default().with_codec(
            herald_core::CodecConfig::default().with_encoding(Encoding::Structured),
        );
        let producer = Producer::new(Arc::new(broker.clone()), config);
        producer
            .publish_event("orders", &EventFixture::new("e1").build())
            .await
            .unwrap();

        let stored = broker.records("orders").await;
        assert_eq!(
            stored[0].message.headers.get_str("content-type"),
            Some("application/cloudevents+json; charset=UTF-8")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_publish_is_visible_in_flight() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(1);
        let config = ProducerConfig::default().with_retry(
            RetryPolicy::new(2)
                .with_jitter(false)
                .with_initial_backoff(std::time::Duration::from_secs(60)),
        );
        let producer = Arc::new(Producer::new(Arc::new(broker.clone()), config));

        let task = {
            let producer = Arc::clone(&producer);
            tokio::spawn(async move {
                producer
                    .publish_event("orders", &EventFixture::new("e1").build())
                    .await
            })
        };

        // Let the first attempt fail and the task park in its backoff.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let pending = producer.in_flight();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, "e1");
        assert_eq!(pending[0].status, DeliveryStatus::Pending);

        let record = task.await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert!(producer.in_flight().is_empty());
    }
}
