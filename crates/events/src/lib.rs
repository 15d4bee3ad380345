//! `postrelay-events`: event mechanics shared by writers and consumers.
//!
//! - typed events and their wire envelope
//! - topic routing keys and binding patterns
//! - broker transport seam (`Transport` / `Connector`) plus an in-memory broker
//! - publisher and handler seams used by services

pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_broker;
pub mod post;
pub mod publisher;
pub mod topic;
pub mod transport;

pub use envelope::EventEnvelope;
pub use event::{DecodeError, DecodeEvent, Event};
pub use handler::{EventHandler, HandleOutcome};
pub use in_memory_broker::{InMemoryBroker, InMemoryTransport};
pub use post::{PostCreated, PostDeleted, PostEvent};
pub use publisher::{EventPublisher, PublishError, publish_event};
pub use topic::Topic;
pub use transport::{Connector, Delivery, DeliveryTag, Transport, TransportError};
