//! Sample payloads for the periodic sender.

use std::collections::BTreeMap;
use std::fmt;

use herald_core::DomainEvent;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// CloudEvents `type` of sample records.
pub const SAMPLE_EVENT_TYPE: &str = "herald.sample.created";

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Claude", "Dennis", "Edsger", "Frances", "Grace", "John", "Ken",
    "Leslie", "Margaret", "Niklaus", "Radia", "Tony",
];

const LAST_NAMES: &[&str] = &[
    "Allen", "Dijkstra", "Hamilton", "Hoare", "Hopper", "Kernighan", "Lamport", "Liskov",
    "Lovelace", "Perlman", "Ritchie", "Shannon", "Thompson", "Turing", "Wirth",
];

const COMPANY_STEMS: &[&str] = &[
    "Acme", "Globex", "Initech", "Hooli", "Umbrella", "Vandelay", "Stark", "Wayne", "Tyrell",
];

const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "and Sons", "Labs", "Systems"];

/// A generated person record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleData {
    pub name: String,
    pub age: u8,
    pub company: String,
}

impl SampleData {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let pick = |rng: &mut R, table: &[&'static str]| -> &'static str {
            table.choose(rng).copied().unwrap_or_default()
        };
        Self {
            name: format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES)),
            age: rng.gen_range(18..70),
            company: format!("{} {}", pick(rng, COMPANY_STEMS), pick(rng, COMPANY_SUFFIXES)),
        }
    }
}

impl fmt::Display for SampleData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SampleData {{ name: {:?}, age: {}, company: {:?} }}",
            self.name, self.age, self.company
        )
    }
}

impl DomainEvent for SampleData {
    fn event_type(&self) -> &str {
        SAMPLE_EVENT_TYPE
    }

    fn extensions(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("name".to_string(), self.name.clone())])
    }
}
