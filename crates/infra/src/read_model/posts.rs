use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use postrelay_core::{Pagination, Post, PostId, UserId};

use super::StoreError;

/// Primary store of the writer service.
pub trait PostRepository: Send + Sync {
    fn find_by_id(&self, id: &PostId) -> Result<Option<Post>, StoreError>;

    fn save(&self, post: Post) -> Result<(), StoreError>;

    /// Delete `id` only if `user` owns it; returns the removed post.
    fn delete_owned(&self, id: &PostId, user: &UserId) -> Result<Option<Post>, StoreError>;

    /// One page, newest first, plus the total count.
    fn find_page(&self, page: Pagination) -> Result<(Vec<Post>, u64), StoreError>;
}

impl<R> PostRepository for Arc<R>
where
    R: PostRepository + ?Sized,
{
    fn find_by_id(&self, id: &PostId) -> Result<Option<Post>, StoreError> {
        (**self).find_by_id(id)
    }

    fn save(&self, post: Post) -> Result<(), StoreError> {
        (**self).save(post)
    }

    fn delete_owned(&self, id: &PostId, user: &UserId) -> Result<Option<Post>, StoreError> {
        (**self).delete_owned(id, user)
    }

    fn find_page(&self, page: Pagination) -> Result<(Vec<Post>, u64), StoreError> {
        (**self).find_page(page)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPostRepository {
    inner: RwLock<HashMap<PostId, Post>>,
}

impl InMemoryPostRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PostRepository for InMemoryPostRepository {
    fn find_by_id(&self, id: &PostId) -> Result<Option<Post>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(id).cloned())
    }

    fn save(&self, post: Post) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(post.id.clone(), post);
        Ok(())
    }

    fn delete_owned(&self, id: &PostId, user: &UserId) -> Result<Option<Post>, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if map.get(id).is_some_and(|p| p.is_owned_by(user)) {
            Ok(map.remove(id))
        } else {
            Ok(None)
        }
    }

    fn find_page(&self, page: Pagination) -> Result<(Vec<Post>, u64), StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut posts: Vec<Post> = map.values().cloned().collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = posts.len() as u64;
        let items = posts
            .into_iter()
            .skip(page.offset())
            .take(page.limit() as usize)
            .collect();
        Ok((items, total))
    }
}
