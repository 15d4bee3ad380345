//! Infrastructure layer: broker channel, consumer runtime, cache, stores,
//! projection handlers and the request-side services built on them.

pub mod blob;
pub mod broker;
pub mod cache;
pub mod config;
pub mod projections;
pub mod read_model;
pub mod services;
pub mod workers;

pub use config::{ConfigError, Endpoint, RelayConfig, ServiceRole};

#[cfg(test)]
mod integration_tests;
