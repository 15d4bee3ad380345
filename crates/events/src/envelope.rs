use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::event::{DecodeError, Event};

/// Envelope for an event, the unit carried by the broker.
///
/// Wire shape (JSON, camelCase):
///
/// ```text
/// { "eventId": "...", "topic": "post.deleted", "schemaVersion": 1,
///   "publishedAt": "2026-01-01T00:00:00Z", "payload": { ... } }
/// ```
///
/// Notes:
/// - `event_id` is unique per publish, not per entity: a redelivery carries
///   the same id, a second publish for the same post does not.
/// - `payload` is topic-specific; see `crate::post`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<E = JsonValue> {
    event_id: Uuid,
    topic: String,
    schema_version: u32,
    published_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        topic: impl Into<String>,
        schema_version: u32,
        published_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            topic: topic.into(),
            schema_version,
            published_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Wrap a typed event for publishing.
    pub fn seal<E: Event>(event: &E, published_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            Uuid::now_v7(),
            E::TOPIC,
            E::SCHEMA_VERSION,
            published_at,
            serde_json::to_value(event)?,
        ))
    }

    /// Re-address an envelope to another topic (dead-lettering), keeping its id.
    pub fn readdressed(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_camel_case() {
        let env = EventEnvelope::new(
            Uuid::nil(),
            "post.deleted",
            1,
            DateTime::<Utc>::UNIX_EPOCH,
            serde_json::json!({"postId": "p1"}),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["topic"], "post.deleted");
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["payload"]["postId"], "p1");
        assert!(value.get("publishedAt").is_some());
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let err = EventEnvelope::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }
}
