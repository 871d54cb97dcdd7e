//! Consumer pipeline: subscriptions that decode, dispatch and commit records.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │  fetch loop (1 per sub)  │  poll(batch_size, poll_timeout)
//!                 └────────────┬─────────────┘
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//!     ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//!     │ partition 0 │   │ partition 1 │   │ partition N │  bounded queue each
//!     │   worker    │   │   worker    │   │   worker    │
//!     └─────────────┘   └─────────────┘   └─────────────┘
//!       decode -> handle (retry) -> dead-letter? -> commit(offset + 1)
//! ```
//!
//! Each partition is processed by exactly one worker task, so records of a
//! partition are handled and committed in offset order while partitions
//! proceed independently.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use herald_broker::{Broker, BrokerConsumer, ConsumerRecord, Partition};
use herald_core::{CloudEvent, Codec};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConsumerConfig, FailurePolicy};
use crate::dead_letter::{DeadLetterReason, DeadLetterRouter};
use crate::error::{HandleError, SubscribeError};
use crate::retry::RetryPolicy;
use crate::state::{RecordProgress, RecordState};

/// Backoff after a failed poll before fetching again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Type alias for async event handlers.
pub type EventHandler = Arc<
    dyn Fn(CloudEvent) -> Pin<Box<dyn Future<Output = Result<(), HandleError>> + Send>>
        + Send
        + Sync,
>;

/// Build an [`EventHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(CloudEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandleError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Live counters of a subscription.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    fetched: AtomicU64,
    handled: AtomicU64,
    retried: AtomicU64,
    decode_failures: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
    committed: AtomicU64,
    commit_failures: AtomicU64,
}

/// Point-in-time copy of [`SubscriptionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Records received from the broker.
    pub fetched: u64,
    /// Records whose handler succeeded.
    pub handled: u64,
    /// Handler retries (not counting first attempts).
    pub retried: u64,
    pub decode_failures: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
    /// Offsets committed.
    pub committed: u64,
    pub commit_failures: u64,
}

impl SubscriptionStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Creates subscriptions against a broker.
pub struct ConsumerPipeline {
    broker: Arc<dyn Broker>,
    codec: Arc<Codec>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl ConsumerPipeline {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        Self {
            broker,
            codec: Arc::new(Codec::default()),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Decode with a custom codec, e.g. one accepting extra content types.
    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Join the configured group on `topic` and start dispatching records to
    /// `handler`.
    ///
    /// Handler failures never stop the subscription: they are retried,
    /// skipped or dead-lettered according to the failure policy.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
    ) -> Result<Subscription, SubscribeError> {
        if self.shutdown.is_cancelled() {
            return Err(SubscribeError::AlreadyShutdown);
        }

        let consumer: Arc<dyn BrokerConsumer> = Arc::from(
            self.broker
                .subscribe(topic, &self.config.group, self.config.start_position)
                .await?,
        );

        let cancel = self.shutdown.child_token();
        let stats = Arc::new(SubscriptionStats::default());
        let dead_letter_topic = self.config.dead_letter_topic_for(topic);

        let worker = Arc::new(Worker {
            consumer: Arc::clone(&consumer),
            codec: Arc::clone(&self.codec),
            handler,
            dead_letter: DeadLetterRouter::new(
                Arc::clone(&self.broker),
                dead_letter_topic.clone(),
                self.config.retry.clone(),
            ),
            policy: self.config.failure_policy,
            retry: self.config.retry.clone(),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        });

        let fetch = FetchLoop {
            topic: topic.to_string(),
            group: self.config.group.clone(),
            batch_size: self.config.batch_size.max(1),
            poll_timeout: self.config.poll_timeout,
            partition_buffer: self.config.partition_buffer.max(1),
            consumer,
            worker,
        };
        let handle = tokio::spawn(fetch.run());

        Ok(Subscription {
            topic: topic.to_string(),
            group: self.config.group.clone(),
            dead_letter_topic,
            stats,
            _guard: cancel.clone().drop_guard(),
            cancel,
            handle,
        })
    }

    /// Signal every subscription created by this pipeline to shut down.
    pub fn shutdown(&self) {
        info!(group = %self.config.group, "Signaling consumer pipeline shutdown");
        self.shutdown.cancel();
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle cancels the subscription without waiting for it.
pub struct Subscription {
    topic: String,
    group: String,
    dead_letter_topic: String,
    stats: Arc<SubscriptionStats>,
    cancel: CancellationToken,
    _guard: DropGuard,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the fetch loop is still alive.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop fetching without waiting for in-flight records.
    pub fn signal_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Graceful shutdown: stop fetching, let in-flight records finish their
    /// current attempt and commit, then leave the group. Records still queued
    /// stay uncommitted and are redelivered to the next group member.
    pub async fn shutdown(self) -> StatsSnapshot {
        info!(topic = %self.topic, group = %self.group, "Shutting down subscription");
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(topic = %self.topic, error = %e, "Subscription task panicked");
        }
        self.stats.snapshot()
    }
}

struct FetchLoop {
    topic: String,
    group: String,
    batch_size: usize,
    poll_timeout: Duration,
    partition_buffer: usize,
    consumer: Arc<dyn BrokerConsumer>,
    worker: Arc<Worker>,
}

impl FetchLoop {
    async fn run(self) {
        let Self {
            topic,
            group,
            batch_size,
            poll_timeout,
            partition_buffer,
            consumer,
            worker,
        } = self;
        let cancel = worker.cancel.clone();
        let mut queues: HashMap<Partition, mpsc::Sender<ConsumerRecord>> = HashMap::new();
        let mut workers = JoinSet::new();

        info!(topic = %topic, group = %group, "Subscription started");

        'fetch: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(topic = %topic, group = %group, "Subscription received shutdown signal");
                    break;
                }
                result = consumer.poll(batch_size, poll_timeout) => {
                    match result {
                        Ok(batch) => {
                            if batch.is_empty() {
                                trace!(topic = %topic, group = %group, "Empty batch, continuing");
                                continue;
                            }

                            debug!(topic = %topic, group = %group, count = batch.len(), "Dispatching batch");

                            for record in batch {
                                SubscriptionStats::incr(&worker.stats.fetched);
                                let queue = queues.entry(record.partition).or_insert_with(|| {
                                    let (tx, rx) = mpsc::channel(partition_buffer);
                                    workers.spawn(partition_worker(Arc::clone(&worker), rx));
                                    tx
                                });

                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => break 'fetch,
                                    sent = queue.send(record) => {
                                        if let Err(e) = sent {
                                            error!(
                                                topic = %topic,
                                                partition = e.0.partition,
                                                offset = e.0.offset,
                                                "Partition worker stopped, record left uncommitted"
                                            );
                                        }
                                    }
                                }
                            }
                        }
                        Err(herald_broker::Error::Closed) => {
                            warn!(topic = %topic, group = %group, "Consumer closed");
                            break;
                        }
                        Err(e) => {
                            error!(topic = %topic, group = %group, error = %e, "Poll failed");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
        }

        // Closing the queues lets idle workers exit; busy ones finish their
        // current record first.
        drop(queues);
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "Partition worker panicked");
            }
        }

        if let Err(e) = consumer.close().await {
            warn!(topic = %topic, group = %group, error = %e, "Failed to close consumer");
        }
        info!(topic = %topic, group = %group, stats = ?worker.stats.snapshot(), "Subscription stopped");
    }
}

async fn partition_worker(worker: Arc<Worker>, mut queue: mpsc::Receiver<ConsumerRecord>) {
    loop {
        let record = tokio::select! {
            biased;
            _ = worker.cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(record) => record,
                None => break,
            },
        };
        worker.process(record).await;
    }
}

/// Everything a partition worker needs to take a record to commit.
struct Worker {
    consumer: Arc<dyn BrokerConsumer>,
    codec: Arc<Codec>,
    handler: EventHandler,
    dead_letter: DeadLetterRouter,
    policy: FailurePolicy,
    retry: RetryPolicy,
    stats: Arc<SubscriptionStats>,
    cancel: CancellationToken,
}

impl Worker {
    async fn process(&self, record: ConsumerRecord) {
        let mut progress = RecordProgress::new();

        progress.advance(RecordState::Decoding);
        let event = match self.codec.decode(&record.message) {
            Ok(event) => {
                progress.advance(RecordState::Decoded);
                event
            }
            Err(e) => {
                progress.advance(RecordState::DecodeFailed);
                SubscriptionStats::incr(&self.stats.decode_failures);
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to decode record"
                );
                let cause = e.to_string();
                if !self
                    .dead_letter(&record, DeadLetterReason::DecodeFailed, &cause, 0)
                    .await
                {
                    return;
                }
                progress.advance(RecordState::DeadLettered);
                self.commit(&record, &mut progress).await;
                return;
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            progress.advance(RecordState::Handling);

            let err = match self.invoke(&event).await {
                Ok(()) => {
                    progress.advance(RecordState::HandleSucceeded);
                    SubscriptionStats::incr(&self.stats.handled);
                    debug!(
                        event_id = %event.id(),
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        "Event handled"
                    );
                    break;
                }
                Err(err) => err,
            };
            progress.advance(RecordState::HandleFailed);

            if self.policy == FailurePolicy::Skip {
                progress.advance(RecordState::Skipped);
                SubscriptionStats::incr(&self.stats.skipped);
                warn!(
                    event_id = %event.id(),
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Handler failed, skipping record"
                );
                break;
            }

            if err.is_retryable() && self.retry.allows_retry(attempt) {
                progress.advance(RecordState::Retrying);
                SubscriptionStats::incr(&self.stats.retried);
                let delay = self.retry.delay_for(attempt);
                warn!(
                    event_id = %event.id(),
                    partition = record.partition,
                    offset = record.offset,
                    attempt,
                    error = %err,
                    ?delay,
                    "Handler failed, retrying"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!(
                            event_id = %event.id(),
                            offset = record.offset,
                            "Shutdown during retry backoff, record left uncommitted"
                        );
                        return;
                    }
                    _ = tokio::time::sleep(delay) => continue,
                }
            }

            let reason = if err.is_retryable() {
                DeadLetterReason::RetriesExhausted
            } else {
                DeadLetterReason::Rejected
            };
            if !self
                .dead_letter(&record, reason, err.message(), attempt)
                .await
            {
                return;
            }
            progress.advance(RecordState::DeadLettered);
            break;
        }

        self.commit(&record, &mut progress).await;
    }

    /// Run the handler once. A panicking handler counts as a retryable failure.
    async fn invoke(&self, event: &CloudEvent) -> Result<(), HandleError> {
        let call = AssertUnwindSafe(async { (self.handler)(event.clone()).await });
        match call.catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(HandleError::new("handler panicked")),
        }
    }

    /// Returns false when shutdown interrupted routing.
    async fn dead_letter(
        &self,
        record: &ConsumerRecord,
        reason: DeadLetterReason,
        cause: &str,
        attempts: u32,
    ) -> bool {
        match self
            .dead_letter
            .route(record, reason, cause, attempts, &self.cancel)
            .await
        {
            Some(_) => {
                SubscriptionStats::incr(&self.stats.dead_lettered);
                true
            }
            None => {
                info!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Shutdown before dead-letter routing completed, record left uncommitted"
                );
                false
            }
        }
    }

    async fn commit(&self, record: &ConsumerRecord, progress: &mut RecordProgress) {
        debug_assert!(progress.state().is_committable());
        let partition = record.topic_partition();
        match self.consumer.commit(&partition, record.offset + 1).await {
            Ok(()) => {
                progress.advance(RecordState::Committed);
                SubscriptionStats::incr(&self.stats.committed);
                trace!(%partition, offset = record.offset, "Offset committed");
            }
            Err(e) => {
                SubscriptionStats::incr(&self.stats.commit_failures);
                error!(%partition, offset = record.offset, error = %e, "Failed to commit offset");
            }
        }
    }
}
