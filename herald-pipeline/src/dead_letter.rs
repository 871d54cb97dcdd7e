//! Dead-letter routing for records the consumer pipeline gives up on.
//!
//! A dead-lettered record keeps its original key, headers and payload byte for
//! byte, so it can be replayed onto the source topic. Diagnostic headers are
//! appended after the original ones.

use std::fmt;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use herald_broker::{Broker, ConsumerRecord, DeliveryAck};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::retry::RetryPolicy;

pub const ORIGINAL_TOPIC_HEADER: &str = "dlt-original-topic";
pub const ORIGINAL_PARTITION_HEADER: &str = "dlt-original-partition";
pub const ORIGINAL_OFFSET_HEADER: &str = "dlt-original-offset";
pub const REASON_HEADER: &str = "dlt-reason";
pub const ERROR_HEADER: &str = "dlt-error";
pub const ATTEMPTS_HEADER: &str = "dlt-attempts";
pub const FAILED_AT_HEADER: &str = "dlt-failed-at";

/// Why a record was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The record is not a valid CloudEvent.
    DecodeFailed,
    /// The handler kept failing until the retry budget ran out.
    RetriesExhausted,
    /// The handler reported a permanent failure.
    Rejected,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecodeFailed => "decode_failed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends failed records to a dead-letter topic.
pub struct DeadLetterRouter {
    broker: Arc<dyn Broker>,
    topic: String,
    backoff: RetryPolicy,
}

impl DeadLetterRouter {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, backoff: RetryPolicy) -> Self {
        Self {
            broker,
            topic: topic.into(),
            backoff,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Route `record` to the dead-letter topic.
    ///
    /// A record must never be committed without reaching either its handler
    /// or the dead-letter topic, so sends are retried until they succeed.
    /// Returns `None` if `cancel` fires first.
    pub async fn route(
        &self,
        record: &ConsumerRecord,
        reason: DeadLetterReason,
        cause: &str,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> Option<DeliveryAck> {
        let mut message = record.message.clone();
        let headers = &mut message.headers;
        headers.append(ORIGINAL_TOPIC_HEADER, record.topic.as_str());
        headers.append(ORIGINAL_PARTITION_HEADER, record.partition.to_string());
        headers.append(ORIGINAL_OFFSET_HEADER, record.offset.to_string());
        headers.append(REASON_HEADER, reason.as_str());
        headers.append(ERROR_HEADER, cause);
        headers.append(ATTEMPTS_HEADER, attempts.to_string());
        headers.append(
            FAILED_AT_HEADER,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            match self.broker.send(&self.topic, message.clone()).await {
                Ok(ack) => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        dead_letter_topic = %self.topic,
                        %reason,
                        error = cause,
                        "Record routed to dead-letter topic"
                    );
                    return Some(ack);
                }
                Err(e) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        dead_letter_topic = %self.topic,
                        attempt,
                        error = %e,
                        "Failed to route record to dead-letter topic"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.backoff.delay_for(attempt)) => {}
            }
        }
    }
}
