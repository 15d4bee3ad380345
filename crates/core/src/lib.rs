//! `postrelay-core`: shared building blocks for the post services.
//!
//! This crate contains **pure** primitives (no broker, cache or store IO).

pub mod clock;
pub mod error;
pub mod id;
pub mod post;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{MediaId, PostId, UserId};
pub use post::{Pagination, Post};
