//! End-to-end delivery scenarios against the in-memory broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herald_broker::{Broker, InMemoryBroker, TopicPartition};
use herald_core::testing::{EventFixture, SampleOrder, deterministic_factory};
use herald_core::{CloudEvent, Codec, CodecConfig, Encoding};
use herald_pipeline::dead_letter::{ATTEMPTS_HEADER, ORIGINAL_OFFSET_HEADER, REASON_HEADER};
use herald_pipeline::{
    ConsumerConfig, ConsumerPipeline, HandleError, PartitionKey, Producer, ProducerConfig,
    RetryPolicy, StatsSnapshot, Subscription, handler_fn,
};
use tokio::sync::Notify;

const GROUP: &str = "scenario-group";

fn producer(broker: &InMemoryBroker) -> Producer {
    Producer::new(
        Arc::new(broker.clone()),
        ProducerConfig::default().with_retry(RetryPolicy::immediate(5)),
    )
    .with_factory(deterministic_factory(1))
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig::new(GROUP)
        .with_poll_timeout(Duration::from_millis(20))
        .with_retry(RetryPolicy::immediate(3))
}

async fn wait_for(sub: &Subscription, done: impl Fn(&StatsSnapshot) -> bool) {
    for _ in 0..500 {
        if done(&sub.stats()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached, stats: {:?}", sub.stats());
}

#[tokio::test]
async fn test_published_event_is_delivered_once_before_commit() {
    let broker = InMemoryBroker::new();
    let ack = producer(&broker)
        .publish("orders", &SampleOrder::new("e1"))
        .await
        .unwrap();
    let tp = TopicPartition::new("orders", ack.partition.unwrap());

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let deliveries = Arc::clone(&deliveries);
        let broker = broker.clone();
        let tp = tp.clone();
        handler_fn(move |event: CloudEvent| {
            let deliveries = Arc::clone(&deliveries);
            let broker = broker.clone();
            let tp = tp.clone();
            async move {
                let committed = broker.committed_offset(GROUP, &tp).await;
                deliveries
                    .lock()
                    .unwrap()
                    .push((event.id().to_string(), committed));
                Ok::<_, HandleError>(())
            }
        })
    };

    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), consumer_config());
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.committed == 1).await;
    // Give a duplicate delivery a chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*deliveries.lock().unwrap(), vec![("e1".to_string(), None)]);
    assert_eq!(
        broker.committed_offset(GROUP, &tp).await,
        Some(ack.offset.unwrap() + 1)
    );
    sub.shutdown().await;
}

#[tokio::test]
async fn test_failing_record_is_dead_lettered_after_retry_budget() {
    let broker = InMemoryBroker::new();
    let producer = producer(&broker);
    producer.publish("orders", &SampleOrder::new("e1")).await.unwrap();
    let failing = producer
        .publish("orders", &SampleOrder::new("e2"))
        .await
        .unwrap();

    let attempts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |event: CloudEvent| {
            let attempts = Arc::clone(&attempts);
            async move {
                *attempts
                    .lock()
                    .unwrap()
                    .entry(event.id().to_string())
                    .or_default() += 1;
                if event.id() == "e2" {
                    return Err(HandleError::new("payment service unavailable"));
                }
                Ok(())
            }
        })
    };

    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), consumer_config());
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.committed == 2).await;

    assert_eq!(attempts.lock().unwrap().get("e2"), Some(&3));
    assert_eq!(attempts.lock().unwrap().get("e1"), Some(&1));

    let dead = broker.records("orders.dlt").await;
    assert_eq!(dead.len(), 1);
    let headers = &dead[0].message.headers;
    assert_eq!(headers.get_str("ce_id"), Some("e2"));
    assert_eq!(headers.get_str(REASON_HEADER), Some("retries_exhausted"));
    assert_eq!(headers.get_str(ATTEMPTS_HEADER), Some("3"));
    let offset = failing.offset.unwrap();
    assert_eq!(
        headers.get_str(ORIGINAL_OFFSET_HEADER),
        Some(offset.to_string().as_str())
    );

    let tp = TopicPartition::new("orders", failing.partition.unwrap());
    assert_eq!(broker.committed_offset(GROUP, &tp).await, Some(offset + 1));

    let stats = sub.shutdown().await;
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.retried, 2);
}

#[tokio::test]
async fn test_malformed_record_skips_handler() {
    let broker = InMemoryBroker::new();
    let mut message = Codec::default()
        .encode(&EventFixture::new("bad").build())
        .unwrap()
        .with_key("bad");
    message.headers.remove("ce_type");
    broker.send("orders", message).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        handler_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandleError>(()) }
        })
    };

    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), consumer_config());
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.committed == 1).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let dead = broker.records("orders.dlt").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.headers.get_str(REASON_HEADER), Some("decode_failed"));
    assert!(!dead[0].message.headers.contains("ce_type"));

    let stats = sub.shutdown().await;
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.handled, 0);
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_in_flight_record() {
    let broker = InMemoryBroker::with_default_partitions(1);
    let producer = producer(&broker);
    producer.publish("orders", &SampleOrder::new("a")).await.unwrap();
    producer.publish("orders", &SampleOrder::new("b")).await.unwrap();

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handled = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let (started, release, handled) =
            (Arc::clone(&started), Arc::clone(&release), Arc::clone(&handled));
        handler_fn(move |event: CloudEvent| {
            let (started, release, handled) =
                (Arc::clone(&started), Arc::clone(&release), Arc::clone(&handled));
            async move {
                if event.id() == "a" {
                    started.notify_one();
                    release.notified().await;
                }
                handled.lock().unwrap().push(event.id().to_string());
                Ok::<_, HandleError>(())
            }
        })
    };

    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), consumer_config());
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    started.notified().await;

    let shutdown = tokio::spawn(sub.shutdown());
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();
    let stats = shutdown.await.unwrap();

    assert_eq!(*handled.lock().unwrap(), vec!["a"]);
    assert_eq!(stats.committed, 1);
    let tp = TopicPartition::new("orders", 0);
    assert_eq!(broker.committed_offset(GROUP, &tp).await, Some(1));

    // The queued record is redelivered to the next member of the group.
    let redelivered = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let redelivered = Arc::clone(&redelivered);
        handler_fn(move |event: CloudEvent| {
            let redelivered = Arc::clone(&redelivered);
            async move {
                redelivered.lock().unwrap().push(event.id().to_string());
                Ok::<_, HandleError>(())
            }
        })
    };
    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), consumer_config());
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.committed == 1).await;
    assert_eq!(*redelivered.lock().unwrap(), vec!["b"]);
    sub.shutdown().await;
}

#[tokio::test]
async fn test_record_in_retry_backoff_stays_uncommitted_on_shutdown() {
    let broker = InMemoryBroker::with_default_partitions(1);
    producer(&broker)
        .publish("orders", &SampleOrder::new("e1"))
        .await
        .unwrap();

    let handler = handler_fn(|_| async { Err::<(), _>(HandleError::new("still failing")) });
    let config = consumer_config().with_retry(
        RetryPolicy::new(3)
            .with_jitter(false)
            .with_initial_backoff(Duration::from_secs(3600)),
    );
    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), config);
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.retried == 1).await;

    let stats = sub.shutdown().await;
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.dead_lettered, 0);
    let tp = TopicPartition::new("orders", 0);
    assert_eq!(broker.committed_offset(GROUP, &tp).await, None);
    assert_eq!(broker.record_count("orders.dlt").await, 0);
}

#[tokio::test]
async fn test_order_is_preserved_within_each_partition() {
    let broker = InMemoryBroker::with_default_partitions(4);
    let producer = Producer::new(
        Arc::new(broker.clone()),
        ProducerConfig::default().with_partition_key(PartitionKey::Extension("stream".into())),
    );

    let streams = ["alpha", "beta", "gamma", "delta"];
    for n in 0..10 {
        for stream in streams {
            let event = EventFixture::new(&format!("{stream}-{n}"))
                .extension("stream", stream)
                .build();
            producer.publish_event("orders", &event).await.unwrap();
        }
    }

    let seen = Arc::new(Mutex::new(HashMap::<String, Vec<u32>>::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |event: CloudEvent| {
            let seen = Arc::clone(&seen);
            async move {
                let stream = event.extension("stream").unwrap_or_default().to_string();
                let seq = event
                    .id()
                    .rsplit('-')
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| HandleError::permanent("bad id"))?;
                // Yield so partitions interleave.
                tokio::task::yield_now().await;
                seen.lock().unwrap().entry(stream).or_default().push(seq);
                Ok::<_, HandleError>(())
            }
        })
    };

    let pipeline = ConsumerPipeline::new(
        Arc::new(broker.clone()),
        consumer_config().with_batch_size(7),
    );
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.committed == 40).await;

    let seen = seen.lock().unwrap();
    for stream in streams {
        assert_eq!(seen[stream], (0..10).collect::<Vec<_>>(), "stream {stream}");
    }
    drop(seen);
    sub.shutdown().await;
}

#[tokio::test]
async fn test_structured_mode_round_trip_and_typed_data() {
    let broker = InMemoryBroker::new();
    let producer = Producer::new(
        Arc::new(broker.clone()),
        ProducerConfig::default()
            .with_codec(CodecConfig::default().with_encoding(Encoding::Structured))
            .with_retry(RetryPolicy::immediate(1)),
    )
    .with_factory(deterministic_factory(9));

    let order = SampleOrder::new("o-77");
    producer.publish("orders", &order).await.unwrap();
    let expected = producer.factory().wrap(&order).unwrap();

    let received = Arc::new(Mutex::new(None));
    let handler = {
        let received = Arc::clone(&received);
        handler_fn(move |event: CloudEvent| {
            let received = Arc::clone(&received);
            async move {
                let data: Option<SampleOrder> = event.data_as()?;
                *received.lock().unwrap() = Some((event, data));
                Ok::<_, HandleError>(())
            }
        })
    };

    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), consumer_config());
    let sub = pipeline.subscribe("orders", handler).await.unwrap();
    wait_for(&sub, |s| s.handled == 1).await;

    let (event, data) = received.lock().unwrap().take().unwrap();
    assert_eq!(event, expected);
    assert_eq!(data, Some(order));
    sub.shutdown().await;
}
