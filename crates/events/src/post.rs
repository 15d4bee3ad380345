//! Events published by the post service.
//!
//! Payload field names are part of the wire contract shared with every
//! consumer (`postId`, `userId`, `content`, `createdAt`, `mediaId`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use postrelay_core::{MediaId, PostId, UserId};

use crate::event::{DecodeError, DecodeEvent, Event, decode_payload};
use crate::topic::{POST_CREATED, POST_DELETED};
use crate::EventEnvelope;

/// `post.created`: a post was committed by the post service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreated {
    pub post_id: PostId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Event for PostCreated {
    const TOPIC: &'static str = POST_CREATED;
    const SCHEMA_VERSION: u32 = 1;

    fn validate(&self) -> Result<(), DecodeError> {
        if self.content.trim().is_empty() {
            return Err(DecodeError::InvalidPayload {
                topic: Self::TOPIC.to_string(),
                reason: "content is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// `post.deleted`: a post was removed; dependents cascade on `postId` and `mediaId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDeleted {
    pub post_id: PostId,
    pub user_id: UserId,
    /// Attached media, `null` (or absent) when the post had none.
    #[serde(default)]
    pub media_id: Option<MediaId>,
}

impl Event for PostDeleted {
    const TOPIC: &'static str = POST_DELETED;
    const SCHEMA_VERSION: u32 = 1;
}

/// All post lifecycle events, decoded by topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostEvent {
    Created(PostCreated),
    Deleted(PostDeleted),
}

impl PostEvent {
    pub fn post_id(&self) -> &PostId {
        match self {
            PostEvent::Created(e) => &e.post_id,
            PostEvent::Deleted(e) => &e.post_id,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            PostEvent::Created(_) => PostCreated::TOPIC,
            PostEvent::Deleted(_) => PostDeleted::TOPIC,
        }
    }
}

impl DecodeEvent for PostEvent {
    fn topics() -> &'static [&'static str] {
        &[POST_CREATED, POST_DELETED]
    }

    fn decode(envelope: EventEnvelope<JsonValue>) -> Result<Self, DecodeError> {
        match envelope.topic() {
            POST_CREATED => decode_payload(envelope).map(PostEvent::Created),
            POST_DELETED => decode_payload(envelope).map(PostEvent::Deleted),
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }
}
