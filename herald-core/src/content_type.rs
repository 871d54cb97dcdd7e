//! Content types the codec knows how to carry.

use std::collections::BTreeSet;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_JSON: &str = "text/json";
pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Media type of a structured-mode CloudEvents JSON envelope.
pub const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

/// Header value written for structured-mode messages.
pub const CLOUDEVENTS_JSON_UTF8: &str = "application/cloudevents+json; charset=UTF-8";

/// Strip parameters and normalise case: `Application/JSON; charset=utf-8` becomes
/// `application/json`.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether payloads of this type are JSON documents.
pub fn is_json(content_type: &str) -> bool {
    let media = media_type(content_type);
    media == APPLICATION_JSON || media == TEXT_JSON || media.ends_with("+json")
}

/// Whether this is a CloudEvents envelope type (structured or batch). Such a
/// type describes a whole event, never its data.
pub fn is_envelope_type(content_type: &str) -> bool {
    media_type(content_type).starts_with("application/cloudevents")
}

/// Whether payloads of this type are text.
pub fn is_text(content_type: &str) -> bool {
    media_type(content_type).starts_with("text/")
}

/// The set of payload content types accepted by a codec.
///
/// Any `+json` structured-syntax suffix is accepted in addition to the
/// registered entries. Envelope types are never accepted as data types, since
/// a binary-mode record carrying one would be read back as structured mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypeRegistry {
    types: BTreeSet<String>,
}

impl Default for ContentTypeRegistry {
    fn default() -> Self {
        Self::empty()
            .with(APPLICATION_JSON)
            .with(TEXT_JSON)
            .with(TEXT_PLAIN)
            .with(OCTET_STREAM)
    }
}

impl ContentTypeRegistry {
    /// A registry that only accepts `+json` suffixed types.
    pub fn empty() -> Self {
        Self {
            types: BTreeSet::new(),
        }
    }

    /// Register an additional content type.
    pub fn register(&mut self, content_type: &str) {
        self.types.insert(media_type(content_type));
    }

    #[must_use]
    pub fn with(mut self, content_type: &str) -> Self {
        self.register(content_type);
        self
    }

    pub fn is_registered(&self, content_type: &str) -> bool {
        if is_envelope_type(content_type) {
            return false;
        }
        let media = media_type(content_type);
        self.types.contains(&media) || media.ends_with("+json")
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(String::as_str)
    }
}
