use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use postrelay_core::{Clock, DomainError, MediaId, Pagination, Post, PostId, UserId};
use postrelay_events::{EventPublisher, PostCreated, PostDeleted, publish_event};

use crate::cache::keys::{post_key, posts_page_key, POSTS_PREFIX};
use crate::cache::{CacheError, CacheStore, ReadThroughCache};
use crate::read_model::{PostRepository, StoreError};

use super::CacheTtls;

#[derive(Debug, Error)]
pub enum PostServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The write was committed but cached views could not be invalidated.
    #[error("cache invalidation failed: {0}")]
    Cache(#[from] CacheError),
}

/// One page of the post listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub current_page: u32,
    pub total_pages: u64,
    pub total_posts: u64,
}

/// Writer service: owns posts, publishes their lifecycle events.
///
/// Every mutation follows the same order: commit to the repository, publish
/// the event, invalidate cached views. A failed publish is logged and does not
/// fail the request; the event is lost (no outbox).
pub struct PostService<R, P, C> {
    repo: R,
    publisher: P,
    cache: ReadThroughCache<C>,
    ttls: CacheTtls,
    clock: Arc<dyn Clock>,
}

impl<R, P, C> core::fmt::Debug for PostService<R, P, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostService").field("ttls", &self.ttls).finish_non_exhaustive()
    }
}

impl<R, P, C> PostService<R, P, C>
where
    R: PostRepository,
    P: EventPublisher,
    C: CacheStore,
{
    pub fn new(repo: R, publisher: P, cache: C, ttls: CacheTtls, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            publisher,
            cache: ReadThroughCache::new(cache),
            ttls,
            clock,
        }
    }

    #[instrument(skip(self, content), fields(user_id = %user), err)]
    pub fn create_post(
        &self,
        user: UserId,
        content: &str,
        media_id: Option<MediaId>,
    ) -> Result<Post, PostServiceError> {
        let post = Post::new(user, content, media_id, self.clock.now())?;
        self.repo.save(post.clone())?;
        info!(post_id = %post.id, "post created");

        let event = PostCreated {
            post_id: post.id.clone(),
            user_id: post.user_id.clone(),
            content: post.content.clone(),
            created_at: post.created_at,
        };
        if let Err(e) = publish_event(&self.publisher, &event) {
            warn!(post_id = %post.id, error = %e, "post.created not published");
        }

        self.invalidate(&post.id)?;
        Ok(post)
    }

    pub fn get_post(&self, id: &PostId) -> Result<Post, PostServiceError> {
        self.cache
            .get_or_load(&post_key(id), self.ttls.post, || self.repo.find_by_id(id))?
            .ok_or_else(|| PostServiceError::Domain(DomainError::not_found("post", id.as_str())))
    }

    pub fn list_posts(&self, page: Pagination) -> Result<PostPage, PostServiceError> {
        let key = posts_page_key(page.page(), page.limit());
        let loaded = self.cache.get_or_load(&key, self.ttls.list, || {
            let (posts, total) = self.repo.find_page(page)?;
            Ok::<_, StoreError>(Some(PostPage {
                posts,
                current_page: page.page(),
                total_pages: page.total_pages(total),
                total_posts: total,
            }))
        })?;
        loaded.ok_or_else(|| PostServiceError::Domain(DomainError::not_found("page", key)))
    }

    /// Delete a post owned by `user`. Unknown ids and other users' posts are both `NotFound`.
    #[instrument(skip(self), fields(post_id = %id, user_id = %user), err)]
    pub fn delete_post(&self, id: &PostId, user: &UserId) -> Result<Post, PostServiceError> {
        let post = self
            .repo
            .delete_owned(id, user)?
            .ok_or_else(|| PostServiceError::Domain(DomainError::not_found("post", id.as_str())))?;
        info!(post_id = %post.id, "post deleted");

        let event = PostDeleted {
            post_id: post.id.clone(),
            user_id: post.user_id.clone(),
            media_id: post.media_id.clone(),
        };
        if let Err(e) = publish_event(&self.publisher, &event) {
            warn!(post_id = %post.id, error = %e, "post.deleted not published");
        }

        self.invalidate(&post.id)?;
        Ok(post)
    }

    fn invalidate(&self, id: &PostId) -> Result<(), CacheError> {
        self.cache.invalidate(&[post_key(id)], &[POSTS_PREFIX])
    }
}
