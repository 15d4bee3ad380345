//! Broker adapter and transports.
//!
//! The transport seam and the in-memory broker live in `postrelay-events` as
//! pure mechanics. This module owns the process-wide channel (reconnect,
//! backoff, serialized access) and the infrastructure-backed transports.

pub mod adapter;
pub mod backoff;
pub mod publisher;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use adapter::{BrokerAdapter, BrokerError, ConnectionState};
pub use backoff::BackoffPolicy;
pub use publisher::BrokerPublisher;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConnector, RedisStreamsTransport};
