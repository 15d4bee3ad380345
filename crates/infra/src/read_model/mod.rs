//! Service-local stores: the writer's post repository and the projections
//! each consumer service owns (search index, media assets).

pub mod media;
pub mod postgres;
pub mod posts;
pub mod search;

use thiserror::Error;

pub use media::{InMemoryMediaStore, MediaAsset, MediaStore};
pub use postgres::{PostgresMediaStore, PostgresSearchStore};
pub use posts::{InMemoryPostRepository, PostRepository};
pub use search::{InMemorySearchStore, SearchHit, SearchRow, SearchStore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store lock poisoned")]
    Poisoned,
}
