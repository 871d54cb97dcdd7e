//! Error types for broker operations.

/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Could not reach or configure the broker.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker did not acknowledge a record.
    #[error("Send failed: {0}")]
    Send(String),

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The consumer was closed.
    #[error("Consumer closed")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Error reported by the Kafka client library.
    #[error("Kafka error: {0}")]
    Kafka(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Send(_) | Self::Timeout(_) | Self::Kafka(_)
        )
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err.to_string())
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;
