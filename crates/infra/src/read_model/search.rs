use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postrelay_core::{PostId, UserId};

use super::StoreError;

/// Search index row, keyed by the originating post id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRow {
    pub post_id: PostId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub row: SearchRow,
    pub score: u32,
}

/// Search projection storage.
///
/// Deleting a post leaves a tombstone, so a `post.created` that arrives after
/// the matching `post.deleted` is refused by `insert_if_absent`. Tombstones are
/// kept until `prune_tombstones` drops them; a create redelivered after its
/// tombstone is pruned would be indexed again, so the horizon must exceed the
/// longest redelivery delay.
pub trait SearchStore: Send + Sync {
    /// Insert unless a row or tombstone for the post exists. Atomic per post id.
    fn insert_if_absent(&self, row: SearchRow) -> Result<bool, StoreError>;

    /// Remove rows for the post and record a tombstone; returns rows removed.
    fn delete_post(&self, post_id: &PostId) -> Result<usize, StoreError>;

    fn get(&self, post_id: &PostId) -> Result<Option<SearchRow>, StoreError>;

    /// Term search: best score first, then newest.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Forget tombstones recorded before `deleted_before`; returns how many went.
    fn prune_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<usize, StoreError>;
}

impl<S> SearchStore for Arc<S>
where
    S: SearchStore + ?Sized,
{
    fn insert_if_absent(&self, row: SearchRow) -> Result<bool, StoreError> {
        (**self).insert_if_absent(row)
    }

    fn delete_post(&self, post_id: &PostId) -> Result<usize, StoreError> {
        (**self).delete_post(post_id)
    }

    fn get(&self, post_id: &PostId) -> Result<Option<SearchRow>, StoreError> {
        (**self).get(post_id)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        (**self).search(query, limit)
    }

    fn count(&self) -> Result<usize, StoreError> {
        (**self).count()
    }

    fn prune_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).prune_tombstones(deleted_before)
    }
}

/// Lowercased alphanumeric terms.
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Occurrences of the query terms in `content`.
pub fn score(content: &str, query_terms: &[String]) -> u32 {
    if query_terms.is_empty() {
        return 0;
    }
    terms(content)
        .iter()
        .filter(|t| query_terms.contains(t))
        .count() as u32
}

pub fn rank(mut hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.row.created_at.cmp(&a.row.created_at))
            .then_with(|| a.row.post_id.cmp(&b.row.post_id))
    });
    hits.truncate(limit);
    hits
}

#[derive(Debug, Default)]
struct Index {
    rows: HashMap<PostId, SearchRow>,
    tombstones: HashMap<PostId, DateTime<Utc>>,
}

/// In-memory search index for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySearchStore {
    inner: RwLock<Index>,
}

impl InMemorySearchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchStore for InMemorySearchStore {
    fn insert_if_absent(&self, row: SearchRow) -> Result<bool, StoreError> {
        let mut index = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if index.tombstones.contains_key(&row.post_id) || index.rows.contains_key(&row.post_id) {
            return Ok(false);
        }
        index.rows.insert(row.post_id.clone(), row);
        Ok(true)
    }

    fn delete_post(&self, post_id: &PostId) -> Result<usize, StoreError> {
        let mut index = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        index.tombstones.entry(post_id.clone()).or_insert_with(Utc::now);
        Ok(usize::from(index.rows.remove(post_id).is_some()))
    }

    fn get(&self, post_id: &PostId) -> Result<Option<SearchRow>, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(index.rows.get(post_id).cloned())
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let query_terms = terms(query);
        let index = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let hits = index
            .rows
            .values()
            .filter_map(|row| {
                let score = score(&row.content, &query_terms);
                (score > 0).then(|| SearchHit {
                    row: row.clone(),
                    score,
                })
            })
            .collect();
        Ok(rank(hits, limit))
    }

    fn count(&self) -> Result<usize, StoreError> {
        let index = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(index.rows.len())
    }

    fn prune_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut index = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let before = index.tombstones.len();
        index.tombstones.retain(|_, deleted_at| *deleted_at >= deleted_before);
        Ok(before - index.tombstones.len())
    }
}
