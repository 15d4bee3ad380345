use thiserror::Error;

use postrelay_core::DomainError;

use crate::cache::keys::search_key;
use crate::cache::{CacheStore, ReadThroughCache};
use crate::read_model::{SearchHit, SearchStore, StoreError};

pub const SEARCH_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum SearchServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read path over the search projection.
#[derive(Debug)]
pub struct SearchService<S, C> {
    store: S,
    cache: ReadThroughCache<C>,
    ttl: std::time::Duration,
}

impl<S, C> SearchService<S, C>
where
    S: SearchStore,
    C: CacheStore,
{
    pub fn new(store: S, cache: C, ttl: std::time::Duration) -> Self {
        Self {
            store,
            cache: ReadThroughCache::new(cache),
            ttl,
        }
    }

    /// Up to ten best matches for `query`.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchServiceError> {
        if query.trim().is_empty() {
            return Err(DomainError::validation("query must not be empty").into());
        }
        let hits = self
            .cache
            .get_or_load(&search_key(query, SEARCH_LIMIT), self.ttl, || {
                self.store.search(query, SEARCH_LIMIT).map(Some)
            })?;
        Ok(hits.unwrap_or_default())
    }
}
