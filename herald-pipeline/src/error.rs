//! Error types for the producer and consumer pipelines.

use herald_core::{DecodeError, EncodeError};

use crate::producer::{DeliveryRecord, DeliveryStatus};

/// Error returned by [`Producer`](crate::Producer) publish operations.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The event could not be turned into a wire message. Not retried.
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] EncodeError),

    /// The broker did not acknowledge the record within the retry budget.
    #[error("Delivery of event {event_id} to {topic} failed after {attempts} attempt(s): {source}")]
    DeliveryFailed {
        event_id: String,
        topic: String,
        attempts: u32,
        source: herald_broker::Error,
    },
}

impl PublishError {
    /// The failed delivery as a [`DeliveryRecord`], or `None` when the event
    /// never reached the broker.
    pub fn delivery_record(&self) -> Option<DeliveryRecord> {
        match self {
            Self::Serialization(_) => None,
            Self::DeliveryFailed {
                event_id,
                topic,
                attempts,
                ..
            } => Some(DeliveryRecord {
                event_id: event_id.clone(),
                topic: topic.clone(),
                partition: None,
                offset: None,
                attempts: *attempts,
                status: DeliveryStatus::Failed,
            }),
        }
    }
}

/// Failure reported by a consumer handler.
///
/// Retryable failures go through the retry budget; permanent ones go to the
/// dead-letter topic on the first failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandleError {
    message: String,
    retryable: bool,
}

impl HandleError {
    /// A failure that may succeed if the record is handled again.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Wrap any error as a retryable failure.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        Self::new(err.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<String> for HandleError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandleError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Data that does not map onto the handler's type will not map on retry either.
impl From<serde_json::Error> for HandleError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("invalid event data: {err}"))
    }
}

impl From<DecodeError> for HandleError {
    fn from(err: DecodeError) -> Self {
        Self::permanent(err.to_string())
    }
}

/// Error returned when starting a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("Failed to create consumer: {0}")]
    Creation(#[from] herald_broker::Error),

    #[error("Consumer pipeline has been shut down")]
    AlreadyShutdown,
}
