//! The CloudEvents v1.0 envelope.
//!
//! A [`CloudEvent`] is always valid once constructed: required attributes are
//! non-empty and extension names follow the CloudEvents naming rules. The only
//! way to build one is through [`EventBuilder`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::BuildError;

/// Attribute names defined by the CloudEvents core spec and the JSON format.
/// None of these may be used as an extension name.
pub const RESERVED_ATTRIBUTES: &[&str] = &[
    "specversion",
    "id",
    "source",
    "type",
    "time",
    "datacontenttype",
    "dataschema",
    "subject",
    "data",
    "data_base64",
];

/// CloudEvents specification version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpecVersion {
    #[default]
    V1_0,
}

impl SpecVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1.0" => Some(Self::V1_0),
            _ => None,
        }
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CloudEvents v1.0 event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEvent {
    id: String,
    source: String,
    ty: String,
    specversion: SpecVersion,
    time: Option<DateTime<Utc>>,
    datacontenttype: Option<String>,
    dataschema: Option<String>,
    subject: Option<String>,
    data: Option<Vec<u8>>,
    extensions: BTreeMap<String, String>,
}

impl CloudEvent {
    /// Start building a new event.
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    /// Reopen this event as a builder, keeping every attribute.
    pub fn to_builder(&self) -> EventBuilder {
        EventBuilder {
            id: Some(self.id.clone()),
            source: Some(self.source.clone()),
            ty: Some(self.ty.clone()),
            time: self.time,
            datacontenttype: self.datacontenttype.clone(),
            dataschema: self.dataschema.clone(),
            subject: self.subject.clone(),
            data: self.data.clone(),
            extensions: self.extensions.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The `type` attribute.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn specversion(&self) -> SpecVersion {
        self.specversion
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    pub fn datacontenttype(&self) -> Option<&str> {
        self.datacontenttype.as_deref()
    }

    pub fn dataschema(&self) -> Option<&str> {
        self.dataschema.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Raw payload bytes, if the event carries data.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    /// Map the payload into a typed value.
    ///
    /// Returns `Ok(None)` when the event has no data.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
    }
}

impl fmt::Display for CloudEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} from {})", self.id, self.ty, self.source)
    }
}

/// Builder for [`CloudEvent`].
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    id: Option<String>,
    source: Option<String>,
    ty: Option<String>,
    time: Option<DateTime<Utc>>,
    datacontenttype: Option<String>,
    dataschema: Option<String>,
    subject: Option<String>,
    data: Option<Vec<u8>>,
    extensions: BTreeMap<String, String>,
}

impl EventBuilder {
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the `type` attribute.
    #[must_use]
    pub fn ty(mut self, ty: impl Into<String>) -> Self {
        self.ty = Some(ty.into());
        self
    }

    #[must_use]
    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn dataschema(mut self, dataschema: impl Into<String>) -> Self {
        self.dataschema = Some(dataschema.into());
        self
    }

    /// Attach a payload together with its content type.
    #[must_use]
    pub fn data(mut self, content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.datacontenttype = Some(content_type.into());
        self.data = Some(data.into());
        self
    }

    /// Attach a payload without declaring a content type.
    #[must_use]
    pub fn data_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[must_use]
    pub fn datacontenttype(mut self, content_type: impl Into<String>) -> Self {
        self.datacontenttype = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn extensions<I, K, V>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.extensions
            .extend(extensions.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Validate and produce the event.
    pub fn build(self) -> Result<CloudEvent, BuildError> {
        let id = required("id", self.id)?;
        let source = required("source", self.source)?;
        let ty = required("type", self.ty)?;

        if let Some(ct) = &self.datacontenttype
            && ct.trim().is_empty()
        {
            return Err(BuildError::InvalidAttribute {
                name: "datacontenttype".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        for name in self.extensions.keys() {
            if !is_valid_extension_name(name) {
                return Err(BuildError::InvalidExtensionName(name.clone()));
            }
        }

        Ok(CloudEvent {
            id,
            source,
            ty,
            specversion: SpecVersion::V1_0,
            time: self.time,
            datacontenttype: self.datacontenttype,
            dataschema: self.dataschema,
            subject: self.subject,
            data: self.data,
            extensions: self.extensions,
        })
    }
}

fn required(name: &'static str, value: Option<String>) -> Result<String, BuildError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(BuildError::InvalidAttribute {
            name: name.to_string(),
            reason: "must not be empty".to_string(),
        }),
        None => Err(BuildError::MissingAttribute(name)),
    }
}

/// Extension names are lowercase ASCII letters and digits, and must not shadow
/// a context attribute.
pub fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && !RESERVED_ATTRIBUTES.contains(&name)
}
