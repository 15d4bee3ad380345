use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use postrelay_core::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache command failed: {0}")]
    Command(String),

    #[error("ttl must be greater than zero")]
    InvalidTtl,

    #[error("cache lock poisoned")]
    Poisoned,
}

/// String key/value cache with per-entry TTL.
///
/// An expired entry must read as absent.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` for `ttl`. A zero `ttl` is rejected with `CacheError::InvalidTtl`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether a (live) entry was removed.
    fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every entry whose key starts with `prefix`; returns how many.
    fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        (**self).delete(key)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        (**self).delete_prefix(prefix)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory cache for tests/dev. Expiry is checked lazily against the clock.
pub struct InMemoryCache {
    inner: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let len = self.inner.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("InMemoryCache").field("entries", &len).finish()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Live (unexpired) entry count.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.inner
            .read()
            .map(|m| m.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        let map = self.inner.read().map_err(|_| CacheError::Poisoned)?;
        Ok(map
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl)?;
        let now = self.clock.now();
        let expires_at = now + ttl;

        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        // Expired entries are swept on write so the map stays bounded by live keys.
        map.retain(|_, e| e.expires_at > now);
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        Ok(map.remove(key).is_some_and(|e| e.expires_at > now))
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        let before = map.len();
        map.retain(|k, _| !k.starts_with(prefix));
        Ok((before - map.len()) as u64)
    }
}
