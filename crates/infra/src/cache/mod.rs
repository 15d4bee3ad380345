//! Response cache: key/value store with TTLs plus a read-through wrapper.
//!
//! The cache is never authoritative. Every entry has a TTL, so a missed
//! invalidation only serves stale data until expiry.

pub mod keys;
pub mod read_through;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use read_through::ReadThroughCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;
pub use store::{CacheError, CacheStore, InMemoryCache};
