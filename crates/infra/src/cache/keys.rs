//! Cache key layout.
//!
//! - `post:<id>`: one post
//! - `posts:<page>:<limit>`: one page of the post listing
//! - `search:<query>:<limit>`: one search result set

use postrelay_core::PostId;

pub const POSTS_PREFIX: &str = "posts:";
pub const SEARCH_PREFIX: &str = "search:";

pub fn post_key(id: &PostId) -> String {
    format!("post:{id}")
}

pub fn posts_page_key(page: u32, limit: u32) -> String {
    format!("{POSTS_PREFIX}{page}:{limit}")
}

/// Queries are trimmed, lowercased and whitespace-collapsed so equivalent
/// searches share an entry.
pub fn search_key(query: &str, limit: usize) -> String {
    let normalized = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    format!("{SEARCH_PREFIX}{normalized}:{limit}")
}
