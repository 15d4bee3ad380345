use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use postrelay_events::{Connector, EventEnvelope, EventPublisher, PublishError};

use super::adapter::{BrokerAdapter, BrokerError};

/// Fire-and-forget publisher over the shared broker channel.
///
/// A publish on a dead channel fails at once and schedules a reconnect on a
/// background thread, so the next write after the broker returns goes out.
#[derive(Debug)]
pub struct BrokerPublisher<C: Connector> {
    adapter: Arc<BrokerAdapter<C>>,
}

impl<C: Connector> BrokerPublisher<C> {
    pub fn new(adapter: Arc<BrokerAdapter<C>>) -> Self {
        Self { adapter }
    }
}

impl<C: Connector> Clone for BrokerPublisher<C> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<C: Connector> EventPublisher for BrokerPublisher<C> {
    fn publish_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), PublishError> {
        match self.adapter.publish(envelope) {
            Ok(()) => {
                info!(topic = %envelope.topic(), event_id = %envelope.event_id(), "event published");
                Ok(())
            }
            Err(BrokerError::Encode(e)) => Err(PublishError::Encode(e)),
            Err(e) if e.is_disconnect() => {
                warn!(topic = %envelope.topic(), event_id = %envelope.event_id(), error = %e, "broker down; event dropped");
                self.adapter.spawn_reconnect();
                Err(PublishError::Disconnected(e.to_string()))
            }
            Err(e) => Err(PublishError::Rejected(e.to_string())),
        }
    }
}
