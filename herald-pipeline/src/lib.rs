//! Producer and consumer pipelines for CloudEvents over a partitioned broker.
//!
//! - [`Producer`] wraps domain events in envelopes, derives a partition key and
//!   publishes with bounded exponential-backoff retry.
//! - [`ConsumerPipeline`] subscribes to a topic, decodes envelopes and hands
//!   them to a handler in partition order. Offsets are committed only after
//!   the handler succeeded or the record reached the dead-letter topic, so
//!   delivery is at-least-once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use herald_broker::InMemoryBroker;
//! use herald_pipeline::{ConsumerConfig, ConsumerPipeline, HandleError, handler_fn};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let pipeline = ConsumerPipeline::new(broker, ConsumerConfig::new("billing"));
//! let subscription = pipeline
//!     .subscribe(
//!         "orders",
//!         handler_fn(|event| async move {
//!             println!("{event}");
//!             Ok::<_, HandleError>(())
//!         }),
//!     )
//!     .await?;
//! subscription.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod producer;
pub mod retry;
pub mod state;

pub use config::{ConsumerConfig, FailurePolicy, KeyFn, PartitionKey, ProducerConfig};
pub use consumer::{
    ConsumerPipeline, EventHandler, StatsSnapshot, Subscription, SubscriptionStats, handler_fn,
};
pub use dead_letter::{DeadLetterReason, DeadLetterRouter};
pub use error::{HandleError, PublishError, SubscribeError};
pub use producer::{DeliveryRecord, DeliveryStatus, Producer};
pub use retry::RetryPolicy;
pub use state::RecordState;
