//! Request-side services: the post writer and the search and media read paths.

pub mod media;
pub mod posts;
pub mod search;

use std::time::Duration;

pub use media::{MediaService, MediaServiceError};
pub use posts::{PostPage, PostService, PostServiceError};
pub use search::{SearchService, SearchServiceError};

/// Cache lifetimes for read-through entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    /// Single post (`post:<id>`).
    pub post: Duration,
    /// Listings and search results.
    pub list: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            post: Duration::from_secs(3600),
            list: Duration::from_secs(300),
        }
    }
}
