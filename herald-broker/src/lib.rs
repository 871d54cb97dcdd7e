//! Broker abstraction for herald.
//!
//! The pipeline talks to a broker only through two traits, so the same code
//! runs against a real Kafka cluster and against a process-local log in tests.
//!
//! # Key Types
//!
//! - [`Broker`] - Topic management, record sends and consumer creation
//! - [`BrokerConsumer`] - Polling with per-partition offset commits
//! - [`InMemoryBroker`] - Partitioned in-memory implementation
//! - `KafkaBroker` - librdkafka implementation (feature `kafka`)

pub mod config;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod partitioner;
pub mod traits;

use std::sync::Arc;

pub use config::{BrokerConfig, BrokerKind};
pub use error::{Error, Result};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::InMemoryBroker;
pub use partitioner::{murmur2, partition_for_key};
pub use traits::{
    Broker, BrokerConsumer, ConsumerRecord, DeliveryAck, Offset, Partition, RecordBatch,
    StartPosition, TopicPartition,
};

/// Build the broker selected by `config.kind`.
pub fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.kind {
        BrokerKind::Memory => Ok(Arc::new(InMemoryBroker::with_default_partitions(
            config.default_partitions,
        ))),
        #[cfg(feature = "kafka")]
        BrokerKind::Kafka => Ok(Arc::new(KafkaBroker::connect(config.clone())?)),
        #[cfg(not(feature = "kafka"))]
        BrokerKind::Kafka => Err(Error::Connection(
            "herald was built without the `kafka` feature".to_string(),
        )),
    }
}
