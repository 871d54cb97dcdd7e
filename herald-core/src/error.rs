//! Error types for herald-core

use thiserror::Error;

/// Errors raised while turning wire bytes back into a [`crate::CloudEvent`].
#[derive(Error, Debug)]
pub enum DecodeError {
    /// A required attribute is missing or the envelope shape is wrong.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The payload content type is not registered with the codec.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// An attribute is present but its value is unusable.
    #[error("Invalid attribute `{name}`: {reason}")]
    InvalidAttribute { name: String, reason: String },

    /// Structured-mode payload is not a JSON object.
    #[error("Invalid JSON envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Errors raised while writing a [`crate::CloudEvent`] to the wire.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] BuildError),
}

/// Errors raised by [`crate::EventBuilder::build`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Missing required attribute `{0}`")]
    MissingAttribute(&'static str),

    #[error("Invalid attribute `{name}`: {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("Invalid extension name `{0}`: must be lowercase ASCII letters or digits")]
    InvalidExtensionName(String),
}

impl From<BuildError> for DecodeError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::MissingAttribute(name) => {
                DecodeError::MalformedEnvelope(format!("missing required attribute `{name}`"))
            }
            BuildError::InvalidAttribute { name, reason } => {
                DecodeError::InvalidAttribute { name, reason }
            }
            BuildError::InvalidExtensionName(name) => DecodeError::InvalidAttribute {
                reason: "not a valid extension name".to_string(),
                name,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_attribute_becomes_malformed_envelope() {
        let err: DecodeError = BuildError::MissingAttribute("type").into();
        assert!(matches!(err, DecodeError::MalformedEnvelope(_)));
        assert!(err.to_string().contains("`type`"));
    }

    #[test]
    fn invalid_extension_name_becomes_invalid_attribute() {
        let err: DecodeError = BuildError::InvalidExtensionName("Bad-Name".into()).into();
        assert!(matches!(
            err,
            DecodeError::InvalidAttribute { ref name, .. } if name == "Bad-Name"
        ));
    }

    #[test]
    fn encode_error_wraps_build_error() {
        let err: EncodeError = BuildError::MissingAttribute("id").into();
        assert!(err.to_string().contains("Missing required attribute `id`"));
    }
}
