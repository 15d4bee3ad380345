use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::EventEnvelope;

/// A typed event published after a committed mutation.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** per topic (the envelope carries `schemaVersion`)
/// - addressed by a single routing key
pub trait Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Routing key the event is published under (e.g. "post.created").
    const TOPIC: &'static str;

    /// Schema version written into the envelope.
    const SCHEMA_VERSION: u32;

    /// Field-level checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Why an inbound message could not become a typed event.
///
/// Every variant is permanent: a malformed message never becomes valid, so
/// consumers drop it instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("no schema registered for topic {0}")]
    UnknownTopic(String),

    #[error("unsupported schema version {found} for {topic} (supported: {supported})")]
    UnsupportedVersion {
        topic: String,
        found: u32,
        supported: u32,
    },

    #[error("invalid {topic} payload: {reason}")]
    InvalidPayload { topic: String, reason: String },

    #[error("envelope topic {envelope} does not match delivery topic {delivery}")]
    TopicMismatch { envelope: String, delivery: String },
}

/// A closed set of events a consumer understands, decoded by topic.
pub trait DecodeEvent: Sized + core::fmt::Debug + Send + 'static {
    /// Topics this set can decode.
    fn topics() -> &'static [&'static str];

    fn decode(envelope: EventEnvelope<JsonValue>) -> Result<Self, DecodeError>;
}

/// Decode one typed payload out of an envelope, checking topic and version.
pub fn decode_payload<E: Event>(envelope: EventEnvelope<JsonValue>) -> Result<E, DecodeError> {
    if envelope.topic() != E::TOPIC {
        return Err(DecodeError::TopicMismatch {
            envelope: envelope.topic().to_string(),
            delivery: E::TOPIC.to_string(),
        });
    }
    if envelope.schema_version() != E::SCHEMA_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            topic: E::TOPIC.to_string(),
            found: envelope.schema_version(),
            supported: E::SCHEMA_VERSION,
        });
    }

    let event: E = serde_json::from_value(envelope.into_payload()).map_err(|e| {
        DecodeError::InvalidPayload {
            topic: E::TOPIC.to_string(),
            reason: e.to_string(),
        }
    })?;
    event.validate()?;
    Ok(event)
}
