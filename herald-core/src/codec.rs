//! Event Envelope Codec: CloudEvents over Kafka records.
//!
//! Two modes are supported, following the CloudEvents Kafka protocol binding:
//!
//! - **Binary**: context attributes travel as `ce_<name>` headers, the
//!   content type as the `content-type` header and the record value is the
//!   raw data.
//! - **Structured**: the whole event is a JSON document in the record value
//!   and `content-type` is `application/cloudevents+json`.
//!
//! Encoding is deterministic: attributes and extensions are written in a
//! fixed order, so the same event always yields byte-identical output.
//! Decoding detects the mode from the `content-type` header and accepts
//! the configured header prefix as well as both `ce_` and `ce-`.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::{trace, warn};

use crate::content_type::{self, CLOUDEVENTS_JSON, CLOUDEVENTS_JSON_UTF8, ContentTypeRegistry};
use crate::error::{DecodeError, EncodeError};
use crate::event::{CloudEvent, EventBuilder, SpecVersion};
use crate::message::{Headers, WireMessage};

/// Header carrying the data content type in binary mode and the envelope
/// content type in structured mode.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Prefix written for binary-mode attribute headers.
pub const DEFAULT_HEADER_PREFIX: &str = "ce_";

/// Prefixes recognised when decoding binary-mode headers.
const ACCEPTED_PREFIXES: &[&str] = &["ce_", "ce-"];

/// How events are laid out in a Kafka record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Binary,
    Structured,
}

/// Codec configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Mode used when encoding. Decoding always auto-detects.
    #[serde(default)]
    pub encoding: Encoding,

    /// Content types accepted on top of the built-in set.
    #[serde(default)]
    pub extra_content_types: Vec<String>,

    /// Prefix for binary-mode attribute headers.
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

fn default_header_prefix() -> String {
    DEFAULT_HEADER_PREFIX.to_string()
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            extra_content_types: Vec::new(),
            header_prefix: default_header_prefix(),
        }
    }
}

impl CodecConfig {
    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.extra_content_types.push(content_type.into());
        self
    }
}

/// Converts between [`CloudEvent`] and [`WireMessage`].
#[derive(Debug, Clone)]
pub struct Codec {
    encoding: Encoding,
    registry: ContentTypeRegistry,
    header_prefix: String,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(&CodecConfig::default())
    }
}

impl Codec {
    pub fn new(config: &CodecConfig) -> Self {
        let mut registry = ContentTypeRegistry::default();
        for content_type in &config.extra_content_types {
            registry.register(content_type);
        }
        let header_prefix = if config.header_prefix.is_empty() {
            warn!(
                default = DEFAULT_HEADER_PREFIX,
                "Empty binary-mode header prefix, using the default"
            );
            DEFAULT_HEADER_PREFIX.to_string()
        } else {
            config.header_prefix.to_ascii_lowercase()
        };
        Self {
            encoding: config.encoding,
            registry,
            header_prefix,
        }
    }

    /// Replace the content type registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ContentTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn registry(&self) -> &ContentTypeRegistry {
        &self.registry
    }

    /// Encode using the configured mode.
    pub fn encode(&self, event: &CloudEvent) -> Result<WireMessage, EncodeError> {
        self.encode_as(event, self.encoding)
    }

    /// Encode using an explicit mode.
    pub fn encode_as(
        &self,
        event: &CloudEvent,
        encoding: Encoding,
    ) -> Result<WireMessage, EncodeError> {
        if let Some(ct) = event.datacontenttype()
            && !self.registry.is_registered(ct)
        {
            return Err(EncodeError::UnsupportedContentType(ct.to_string()));
        }

        let message = match encoding {
            Encoding::Binary => self.encode_binary(event),
            Encoding::Structured => encode_structured(event)?,
        };
        trace!(event_id = %event.id(), ?encoding, size = message.size(), "Encoded event");
        Ok(message)
    }

    /// Decode a record, detecting the mode from its `content-type` header.
    pub fn decode(&self, message: &WireMessage) -> Result<CloudEvent, DecodeError> {
        let envelope_type = message.headers.get_str(CONTENT_TYPE_HEADER);
        let event = match envelope_type {
            Some(ct) if content_type::is_envelope_type(ct) => {
                if content_type::media_type(ct) != CLOUDEVENTS_JSON {
                    return Err(DecodeError::UnsupportedContentType(ct.to_string()));
                }
                decode_structured(message)?
            }
            _ => self.decode_binary(message)?,
        };

        if let Some(ct) = event.datacontenttype()
            && !self.registry.is_registered(ct)
        {
            return Err(DecodeError::UnsupportedContentType(ct.to_string()));
        }
        Ok(event)
    }

    fn encode_binary(&self, event: &CloudEvent) -> WireMessage {
        let prefix = &self.header_prefix;
        let mut headers = Headers::new();
        headers.append(format!("{prefix}specversion"), event.specversion().as_str());
        headers.append(format!("{prefix}id"), event.id());
        headers.append(format!("{prefix}source"), event.source());
        headers.append(format!("{prefix}type"), event.ty());
        if let Some(time) = event.time() {
            headers.append(format!("{prefix}time"), format_time(time));
        }
        if let Some(subject) = event.subject() {
            headers.append(format!("{prefix}subject"), subject);
        }
        if let Some(schema) = event.dataschema() {
            headers.append(format!("{prefix}dataschema"), schema);
        }
        if let Some(ct) = event.datacontenttype() {
            headers.append(CONTENT_TYPE_HEADER, ct);
        }
        for (name, value) in event.extensions() {
            headers.append(format!("{prefix}{name}"), value.as_str());
        }

        WireMessage {
            key: None,
            headers,
            payload: event.data().map(<[u8]>::to_vec),
        }
    }

    /// Attribute headers may use the configured prefix or any of the
    /// standard ones.
    fn decode_binary(&self, message: &WireMessage) -> Result<CloudEvent, DecodeError> {
        let mut attrs = Attributes::default();

        for (name, value) in message.headers.iter() {
            let lower = name.to_ascii_lowercase();
            if lower == CONTENT_TYPE_HEADER {
                continue;
            }
            let Some(attr) = std::iter::once(self.header_prefix.as_str())
                .chain(ACCEPTED_PREFIXES.iter().copied())
                .find_map(|prefix| lower.strip_prefix(prefix))
            else {
                continue;
            };
            let value = std::str::from_utf8(value).map_err(|_| DecodeError::InvalidAttribute {
                name: attr.to_string(),
                reason: "header value is not valid UTF-8".to_string(),
            })?;
            attrs.set(attr, value.to_string())?;
        }

        if let Some(ct) = message.headers.get(CONTENT_TYPE_HEADER) {
            let ct = std::str::from_utf8(ct).map_err(|_| DecodeError::InvalidAttribute {
                name: "datacontenttype".to_string(),
                reason: "header value is not valid UTF-8".to_string(),
            })?;
            attrs.set("datacontenttype", ct.to_string())?;
        }

        if let Some(payload) = &message.payload {
            attrs.builder = attrs.builder.data_bytes(payload.clone());
        }

        attrs.finish()
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DecodeError::InvalidAttribute {
            name: "time".to_string(),
            reason: e.to_string(),
        })
}

fn check_specversion(value: Option<&str>) -> Result<(), DecodeError> {
    match value {
        None => Err(DecodeError::MalformedEnvelope(
            "missing required attribute `specversion`".to_string(),
        )),
        Some(v) if SpecVersion::parse(v).is_some() => Ok(()),
        Some(v) => Err(DecodeError::InvalidAttribute {
            name: "specversion".to_string(),
            reason: format!("unsupported version {v}"),
        }),
    }
}

/// Collected context attributes, shared by both decoders.
#[derive(Default)]
struct Attributes {
    specversion: Option<String>,
    builder: EventBuilder,
}

impl Attributes {
    fn set(&mut self, name: &str, value: String) -> Result<(), DecodeError> {
        let builder = std::mem::take(&mut self.builder);
        self.builder = match name {
            "specversion" => {
                self.specversion = Some(value);
                builder
            }
            "id" => builder.id(value),
            "source" => builder.source(value),
            "type" => builder.ty(value),
            "time" => builder.time(parse_time(&value)?),
            "subject" => builder.subject(value),
            "dataschema" => builder.dataschema(value),
            "datacontenttype" => builder.datacontenttype(value),
            _ => builder.extension(name, value),
        };
        Ok(())
    }

    fn finish(self) -> Result<CloudEvent, DecodeError> {
        check_specversion(self.specversion.as_deref())?;
        Ok(self.builder.build()?)
    }
}

fn encode_structured(event: &CloudEvent) -> Result<WireMessage, EncodeError> {
    let mut doc: BTreeMap<&str, Box<RawValue>> = BTreeMap::new();

    doc.insert("specversion", raw(event.specversion().as_str())?);
    doc.insert("id", raw(event.id())?);
    doc.insert("source", raw(event.source())?);
    doc.insert("type", raw(event.ty())?);
    if let Some(time) = event.time() {
        doc.insert("time", raw(&format_time(time))?);
    }
    if let Some(subject) = event.subject() {
        doc.insert("subject", raw(subject)?);
    }
    if let Some(schema) = event.dataschema() {
        doc.insert("dataschema", raw(schema)?);
    }
    if let Some(ct) = event.datacontenttype() {
        doc.insert("datacontenttype", raw(ct)?);
    }
    for (name, value) in event.extensions() {
        doc.insert(name.as_str(), raw(value)?);
    }
    if let Some(data) = event.data() {
        let (key, value) = structured_data(event.datacontenttype(), data)?;
        doc.insert(key, value);
    }

    let mut headers = Headers::new();
    headers.append(CONTENT_TYPE_HEADER, CLOUDEVENTS_JSON_UTF8);

    Ok(WireMessage {
        key: None,
        headers,
        payload: Some(serde_json::to_vec(&doc)?),
    })
}

fn raw<T: Serialize + ?Sized>(value: &T) -> Result<Box<RawValue>, serde_json::Error> {
    serde_json::value::to_raw_value(value)
}

/// JSON payloads are embedded verbatim, text as a JSON string, everything
/// else (or JSON that would not survive verbatim) as `data_base64`.
fn structured_data(
    content_type: Option<&str>,
    data: &[u8],
) -> Result<(&'static str, Box<RawValue>), EncodeError> {
    if let Some(ct) = content_type
        && let Ok(text) = std::str::from_utf8(data)
    {
        if content_type::is_json(ct) {
            if let Ok(raw) = RawValue::from_string(text.to_string())
                && raw.get().len() == text.len()
            {
                return Ok(("data", raw));
            }
        } else if content_type::is_text(ct) {
            return Ok(("data", raw(text)?));
        }
    }
    Ok(("data_base64", raw(&BASE64.encode(data))?))
}

fn decode_structured(message: &WireMessage) -> Result<CloudEvent, DecodeError> {
    let payload = message
        .payload
        .as_deref()
        .ok_or_else(|| DecodeError::MalformedEnvelope("structured envelope has no body".into()))?;
    let doc: BTreeMap<String, Box<RawValue>> = serde_json::from_slice(payload)?;

    if doc.contains_key("data") && doc.contains_key("data_base64") {
        return Err(DecodeError::MalformedEnvelope(
            "both `data` and `data_base64` are present".to_string(),
        ));
    }

    let mut attrs = Attributes::default();
    for (name, raw) in &doc {
        if name == "data" || name == "data_base64" {
            continue;
        }
        let value = attribute_string(name, raw)?;
        attrs.set(name, value)?;
    }

    let data_type = doc
        .get("datacontenttype")
        .map(|raw| attribute_string("datacontenttype", raw))
        .transpose()?;

    if let Some(raw) = doc.get("data_base64") {
        let encoded: String =
            serde_json::from_str(raw.get()).map_err(|e| invalid("data_base64", e))?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| invalid("data_base64", e))?;
        attrs.builder = attrs.builder.data_bytes(bytes);
    } else if let Some(raw) = doc.get("data") {
        let is_json = data_type.as_deref().is_none_or(content_type::is_json);
        let bytes = if is_json {
            raw.get().as_bytes().to_vec()
        } else {
            match serde_json::from_str::<String>(raw.get()) {
                Ok(text) => text.into_bytes(),
                Err(_) => raw.get().as_bytes().to_vec(),
            }
        };
        attrs.builder = attrs.builder.data_bytes(bytes);
    }

    attrs.finish()
}

/// Context attributes are strings; extensions may also be JSON numbers or
/// booleans, which are kept in their canonical text form.
fn attribute_string(name: &str, raw: &RawValue) -> Result<String, DecodeError> {
    match serde_json::from_str::<serde_json::Value>(raw.get()).map_err(|e| invalid(name, e))? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) if is_extension(name) => Ok(n.to_string()),
        serde_json::Value::Bool(b) if is_extension(name) => Ok(b.to_string()),
        other => Err(DecodeError::InvalidAttribute {
            name: name.to_string(),
            reason: format!("expected a string, found {other}"),
        }),
    }
}

fn is_extension(name: &str) -> bool {
    !crate::event::RESERVED_ATTRIBUTES.contains(&name)
}

fn invalid(name: &str, err: impl std::fmt::Display) -> DecodeError {
    DecodeError::InvalidAttribute {
        name: name.to_string(),
        reason: err.to_string(),
    }
}
