//! Writer-side publishing seam.
//!
//! Services publish through `EventPublisher` only after their own mutation
//! has committed. Publishing is fire-and-forget from the writer's point of
//! view: callers log a `PublishError` and still report success, because the
//! committed mutation is the source of truth.
//!
//! Keeping this a trait leaves room for an outbox-backed publisher (record the
//! envelope in the writer's transaction, relay it later with retry) without
//! touching the services.

use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use crate::{Event, EventEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// No usable broker channel; the event was dropped.
    #[error("broker unavailable, event dropped: {0}")]
    Disconnected(String),

    #[error("failed to encode event: {0}")]
    Encode(String),

    /// The broker refused the publish on a healthy channel.
    #[error("broker rejected publish: {0}")]
    Rejected(String),
}

pub trait EventPublisher: Send + Sync {
    fn publish_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), PublishError>;
}

impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    fn publish_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), PublishError> {
        (**self).publish_envelope(envelope)
    }
}

/// Seal a typed event and publish it.
pub fn publish_event<E, P>(publisher: &P, event: &E) -> Result<EventEnvelope<JsonValue>, PublishError>
where
    E: Event,
    P: EventPublisher + ?Sized,
{
    let envelope =
        EventEnvelope::seal(event, Utc::now()).map_err(|e| PublishError::Encode(e.to_string()))?;
    publisher.publish_envelope(&envelope)?;
    Ok(envelope)
}
