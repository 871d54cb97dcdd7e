//! herald-core: CloudEvents envelopes and their Kafka wire format.
//!
//! This crate has no I/O. It provides:
//!
//! - **Envelope** - [`CloudEvent`] and its validating [`EventBuilder`]
//! - **Codec** - [`Codec`] for binary and structured mode over Kafka records
//! - **Factory** - [`EnvelopeFactory`] wrapping [`DomainEvent`]s with ids and timestamps
//!
//! # Example
//!
//! ```
//! use herald_core::{CloudEvent, Codec};
//!
//! let event = CloudEvent::builder()
//!     .id("e1")
//!     .source("/orders")
//!     .ty("order.created")
//!     .data("application/json", br#"{"total":42}"#.to_vec())
//!     .build()?;
//!
//! let codec = Codec::default();
//! let message = codec.encode(&event)?;
//! assert_eq!(codec.decode(&message)?, event);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codec;
pub mod content_type;
pub mod error;
pub mod event;
pub mod factory;
pub mod message;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::{Codec, CodecConfig, Encoding};
pub use content_type::ContentTypeRegistry;
pub use error::{BuildError, DecodeError, EncodeError};
pub use event::{CloudEvent, EventBuilder, SpecVersion};
pub use factory::{
    Clock, DomainEvent, EnvelopeFactory, FixedClock, IdGenerator, SeededIdGenerator, SystemClock,
    UuidGenerator,
};
pub use message::{Headers, WireMessage};
