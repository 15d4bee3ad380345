//! Projection handlers.
//!
//! Each handler keeps one service's local view in step with post events. All
//! handlers are:
//! - **Idempotent**: duplicate deliveries leave the same end state
//! - **Order-tolerant**: a late `post.created` never revives a deleted post
//! - **Service-local**: they only touch stores owned by their hosting service

pub mod media_cleanup;
pub mod search_index;

use thiserror::Error;

use crate::blob::BlobError;
use crate::read_model::StoreError;

pub use media_cleanup::MediaCleanupProjection;
pub use search_index::SearchIndexProjection;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}
