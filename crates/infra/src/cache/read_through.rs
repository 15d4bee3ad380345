use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::store::{CacheError, CacheStore};

/// Read-through wrapper over a `CacheStore`.
///
/// Reads are best-effort: a failing or corrupt cache falls through to the
/// loader. Invalidation errors are reported to the caller.
#[derive(Debug, Clone)]
pub struct ReadThroughCache<C> {
    store: C,
}

impl<C: CacheStore> ReadThroughCache<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Return the cached value for `key`, or run `loader` and cache what it finds.
    ///
    /// `Ok(None)` from the loader (nothing to show) is passed through uncached.
    pub fn get_or_load<T, E, F>(&self, key: &str, ttl: Duration, loader: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<Option<T>, E>,
    {
        match self.store.get(key) {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    return Ok(Some(value));
                }
                Err(e) => {
                    warn!(key, error = %e, "discarding corrupt cache entry");
                    if let Err(e) = self.store.delete(key) {
                        warn!(key, error = %e, "failed to evict corrupt cache entry");
                    }
                }
            },
            Ok(None) => debug!(key, "cache miss"),
            Err(e) => warn!(key, error = %e, "cache read failed; loading from store"),
        }

        let loaded = loader()?;
        if let Some(value) = &loaded {
            match serde_json::to_string(value) {
                Ok(raw) => {
                    if let Err(e) = self.store.set(key, &raw, ttl) {
                        warn!(key, error = %e, "cache write failed");
                    }
                }
                Err(e) => warn!(key, error = %e, "failed to serialize cache entry"),
            }
        }
        Ok(loaded)
    }

    /// Drop exact `keys` and every key under `prefixes`.
    ///
    /// All deletions are attempted; the first error is returned.
    pub fn invalidate(&self, keys: &[String], prefixes: &[&str]) -> Result<(), CacheError> {
        let mut first_err = None;

        for key in keys {
            if let Err(e) = self.store.delete(key) {
                warn!(key = %key, error = %e, "cache invalidation failed");
                first_err.get_or_insert(e);
            }
        }
        for prefix in prefixes {
            match self.store.delete_prefix(prefix) {
                Ok(n) => debug!(prefix, removed = n, "cache prefix invalidated"),
                Err(e) => {
                    warn!(prefix, error = %e, "cache prefix invalidation failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}
