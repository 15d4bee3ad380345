use tracing::{debug, info, warn};

use postrelay_events::{EventHandler, HandleOutcome, PostCreated, PostDeleted, PostEvent};

use crate::cache::keys::SEARCH_PREFIX;
use crate::cache::{CacheStore, ReadThroughCache};
use crate::read_model::{SearchRow, SearchStore};

use super::HandlerError;

/// Keeps the search index in step with posts.
///
/// - `post.created` inserts a row unless the post is indexed or tombstoned
/// - `post.deleted` removes the row and tombstones the id
///
/// Any change drops cached search results.
#[derive(Debug)]
pub struct SearchIndexProjection<S, C> {
    store: S,
    cache: ReadThroughCache<C>,
}

impl<S, C> SearchIndexProjection<S, C>
where
    S: SearchStore,
    C: CacheStore,
{
    pub fn new(store: S, cache: C) -> Self {
        Self {
            store,
            cache: ReadThroughCache::new(cache),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn on_created(&self, e: PostCreated) -> Result<HandleOutcome, HandlerError> {
        let post_id = e.post_id.clone();
        let inserted = self.store.insert_if_absent(SearchRow {
            post_id: e.post_id,
            user_id: e.user_id,
            content: e.content,
            created_at: e.created_at,
        })?;

        if inserted {
            info!(post_id = %post_id, "search row indexed");
            self.drop_cached_results();
            Ok(HandleOutcome::Applied)
        } else {
            debug!(post_id = %post_id, "post already indexed or deleted");
            Ok(HandleOutcome::Skipped)
        }
    }

    fn on_deleted(&self, e: PostDeleted) -> Result<HandleOutcome, HandlerError> {
        let removed = self.store.delete_post(&e.post_id)?;
        if removed == 0 {
            warn!(post_id = %e.post_id, user_id = %e.user_id, "no search row to delete");
            return Ok(HandleOutcome::Skipped);
        }

        info!(post_id = %e.post_id, removed, "search row removed");
        self.drop_cached_results();
        Ok(HandleOutcome::Applied)
    }

    fn drop_cached_results(&self) {
        // Stale results expire with their TTL if this fails.
        let _ = self.cache.invalidate(&[], &[SEARCH_PREFIX]);
    }
}

impl<S, C> EventHandler for SearchIndexProjection<S, C>
where
    S: SearchStore + 'static,
    C: CacheStore + 'static,
{
    type Event = PostEvent;
    type Error = HandlerError;

    fn name(&self) -> &'static str {
        "search.index"
    }

    fn handle(&self, event: PostEvent) -> Result<HandleOutcome, HandlerError> {
        match event {
            PostEvent::Created(e) => self.on_created(e),
            PostEvent::Deleted(e) => self.on_deleted(e),
        }
    }
}
