//! Broker transport seam (mechanics only).
//!
//! A `Transport` is one open channel to a broker. It is deliberately `&mut`
//! everywhere: protocol framing requires serialized access, so the owner
//! (the broker adapter in `postrelay-infra`) guards it behind a single mutex.
//!
//! ## Delivery model
//!
//! - Publishing routes a body by topic to every queue whose binding matches.
//! - A queue with several consumers hands each message to one of them
//!   (competing consumers).
//! - A fetched message stays *unacked* until `ack`/`reject`. If the channel
//!   dies first, the broker makes it available again (at-least-once).
//! - Within one queue, messages are fetched in publish order.

use thiserror::Error;

/// Opaque, transport-assigned handle for acknowledging one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub topic: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// An established channel died; the owner must reconnect.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The broker rejected an operation on a healthy channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport cannot express the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// True when the channel is gone and a reconnect is required.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused(_) | TransportError::ConnectionLost(_)
        )
    }
}

/// One open channel to a broker.
pub trait Transport: Send {
    /// Assert the topic exchange exists (idempotent).
    fn declare_exchange(&mut self, exchange: &str) -> Result<(), TransportError>;

    /// Route `body` to every queue bound to a matching pattern.
    fn publish(&mut self, exchange: &str, topic: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Declare `queue` (idempotent) and bind it to `pattern` on `exchange`.
    fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str)
    -> Result<(), TransportError>;

    /// Take up to `max` messages from `queue` without blocking for long.
    fn fetch(&mut self, queue: &str, max: usize) -> Result<Vec<Delivery>, TransportError>;

    /// Remove a delivery from the queue for good.
    fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Give a delivery back (`requeue`) or discard it.
    fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;
}

/// Opens transports; the adapter calls it again on every reconnect.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    fn connect(&self) -> Result<Self::Transport, TransportError>;

    /// Human-readable target for logs (must not include credentials).
    fn describe(&self) -> String;
}
