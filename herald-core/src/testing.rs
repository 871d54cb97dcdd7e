//! Fixture builders for tests.
//!
//! Enabled inside this crate's tests and, for other crates, through the
//! `testing` feature.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{CloudEvent, EventBuilder};
use crate::factory::{DomainEvent, EnvelopeFactory, FixedClock, SeededIdGenerator};

/// The instant every fixture is stamped with.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Builder for a valid CloudEvent with sensible defaults.
pub struct EventFixture {
    builder: EventBuilder,
}

impl EventFixture {
    /// An `order.created` event from `/orders` with the given id.
    pub fn new(id: &str) -> Self {
        Self {
            builder: CloudEvent::builder()
                .id(id)
                .source("/orders")
                .ty("order.created")
                .time(fixed_time()),
        }
    }

    #[must_use]
    pub fn ty(mut self, ty: &str) -> Self {
        self.builder = self.builder.ty(ty);
        self
    }

    #[must_use]
    pub fn source(mut self, source: &str) -> Self {
        self.builder = self.builder.source(source);
        self
    }

    #[must_use]
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.builder = self
            .builder
            .data("application/json", value.to_string().into_bytes());
        self
    }

    #[must_use]
    pub fn extension(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.extension(name, value);
        self
    }

    /// # Panics
    ///
    /// Panics if the fixture was given invalid attributes.
    pub fn build(self) -> CloudEvent {
        self.builder.build().expect("fixture event must be valid")
    }
}

/// A small domain event used across pipeline tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOrder {
    pub id: String,
    pub customer: String,
    pub total_cents: u64,
}

impl SampleOrder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            customer: "Ada Lovelace".to_string(),
            total_cents: 4_200,
        }
    }
}

impl DomainEvent for SampleOrder {
    fn event_type(&self) -> &str {
        "order.created"
    }

    fn event_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    fn subject(&self) -> Option<String> {
        Some(format!("order/{}", self.id))
    }

    fn extensions(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("customer".to_string(), self.customer.clone())])
    }
}

/// Factory stamping `/orders` envelopes with seeded ids and [`fixed_time`].
pub fn deterministic_factory(seed: u64) -> EnvelopeFactory {
    EnvelopeFactory::new("/orders")
        .with_id_generator(Arc::new(SeededIdGenerator::new(seed)))
        .with_clock(Arc::new(FixedClock(fixed_time())))
}
