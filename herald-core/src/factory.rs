//! Wrapping domain events into CloudEvents.
//!
//! [`EnvelopeFactory`] owns the producer-side metadata (source, id generation,
//! clock). Ids and time are injectable so that envelope construction is fully
//! deterministic under test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::content_type::APPLICATION_JSON;
use crate::error::EncodeError;
use crate::event::CloudEvent;

/// An application event that can be published as a CloudEvent.
///
/// The event itself is serialized as the JSON `data` of the envelope.
pub trait DomainEvent: Serialize {
    /// Value of the CloudEvents `type` attribute.
    fn event_type(&self) -> &str;

    /// Externally supplied id. When `None` the factory generates one.
    fn event_id(&self) -> Option<String> {
        None
    }

    fn subject(&self) -> Option<String> {
        None
    }

    /// Extension attributes to attach to the envelope.
    fn extensions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Source of event ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random UUIDv4 ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// UUID-shaped ids derived from a seed and a counter. The same seed always
/// yields the same sequence.
#[derive(Debug)]
pub struct SeededIdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl SeededIdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SeededIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.seed.to_be_bytes());
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }
}

/// Source of the `time` attribute.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Builds envelopes for domain events on behalf of one producer.
#[derive(Clone)]
pub struct EnvelopeFactory {
    source: String,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EnvelopeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeFactory")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl EnvelopeFactory {
    /// Factory with random ids and the system clock.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ids: Arc::new(UuidGenerator),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Serialize `event` as JSON data and wrap it in a CloudEvent.
    pub fn wrap<E>(&self, event: &E) -> Result<CloudEvent, EncodeError>
    where
        E: DomainEvent + ?Sized,
    {
        let data = serde_json::to_vec(event)?;
        let id = event.event_id().unwrap_or_else(|| self.ids.next_id());

        let mut builder = CloudEvent::builder()
            .id(id)
            .source(self.source.as_str())
            .ty(event.event_type())
            .time(self.clock.now())
            .data(APPLICATION_JSON, data)
            .extensions(event.extensions());
        if let Some(subject) = event.subject() {
            builder = builder.subject(subject);
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use chrono::TimeZone;

    #[derive(Serialize)]
    struct UserSignedUp {
        name: String,
        age: u32,
    }

    impl DomainEvent for UserSignedUp {
        fn event_type(&self) -> &str {
            "user.signed_up"
        }

        fn extensions(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("name".to_string(), self.name.clone())])
        }
    }

    fn fixed_factory(seed: u64) -> EnvelopeFactory {
        EnvelopeFactory::new("/users")
            .with_id_generator(Arc::new(SeededIdGenerator::new(seed)))
            .with_clock(Arc::new(FixedClock(
                Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            )))
    }

    #[test]
    fn wrap_sets_attributes_and_json_data() {
        let event = UserSignedUp {
            name: "Grace".into(),
            age: 37,
        };
        let envelope = fixed_factory(1).wrap(&event).unwrap();
        assert_eq!(envelope.source(), "/users");
        assert_eq!(envelope.ty(), "user.signed_up");
        assert_eq!(envelope.datacontenttype(), Some("application/json"));
        assert_eq!(envelope.extension("name"), Some("Grace"));
        assert_eq!(envelope.data(), Some(br#"{"name":"Grace","age":37}"#.as_slice()));
    }

    #[test]
    fn seeded_ids_are_reproducible() {
        let a = SeededIdGenerator::new(7);
        let b = SeededIdGenerator::new(7);
        let first: Vec<_> = (0..3).map(|_| a.next_id()).collect();
        let second: Vec<_> = (0..3).map(|_| b.next_id()).collect();
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
        assert_ne!(SeededIdGenerator::new(8).next_id(), first[0]);
    }

    #[test]
    fn same_seed_yields_identical_bytes() {
        let event = UserSignedUp {
            name: "Grace".into(),
            age: 37,
        };
        let codec = Codec::default();
        let a = codec.encode(&fixed_factory(9).wrap(&event).unwrap()).unwrap();
        let b = codec.encode(&fixed_factory(9).wrap(&event).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn external_id_wins_over_generator() {
        #[derive(Serialize)]
        struct Keyed;
        impl DomainEvent for Keyed {
            fn event_type(&self) -> &str {
                "keyed"
            }
            fn event_id(&self) -> Option<String> {
                Some("given-id".to_string())
            }
        }
        let envelope = EnvelopeFactory::new("/k").wrap(&Keyed).unwrap();
        assert_eq!(envelope.id(), "given-id");
    }

    #[test]
    fn invalid_extension_is_an_encode_error() {
        #[derive(Serialize)]
        struct Bad;
        impl DomainEvent for Bad {
            fn event_type(&self) -> &str {
                "bad"
            }
            fn extensions(&self) -> BTreeMap<String, String> {
                BTreeMap::from([("Not-Valid".to_string(), "x".to_string())])
            }
        }
        let err = EnvelopeFactory::new("/b").wrap(&Bad).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidEvent(_)));
    }
}
