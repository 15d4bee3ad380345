//! Post entity owned by the writer service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{MediaId, PostId, UserId};

pub const CONTENT_MIN_CHARS: usize = 3;
pub const CONTENT_MAX_CHARS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub user_id: UserId,
    pub content: String,
    #[serde(default)]
    pub media_id: Option<MediaId>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Build a new post with a fresh id after validating the content.
    pub fn new(
        user_id: UserId,
        content: impl Into<String>,
        media_id: Option<MediaId>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let content = content.into();
        validate_content(&content)?;
        Ok(Self {
            id: PostId::new(),
            user_id,
            content,
            media_id,
            created_at,
        })
    }

    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.user_id == user
    }
}

/// Content length is counted in characters, not bytes.
pub fn validate_content(content: &str) -> DomainResult<()> {
    let len = content.chars().count();
    if len < CONTENT_MIN_CHARS {
        return Err(DomainError::validation(format!(
            "content must be at least {CONTENT_MIN_CHARS} characters"
        )));
    }
    if len > CONTENT_MAX_CHARS {
        return Err(DomainError::validation(format!(
            "content must be at most {CONTENT_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

/// Page request for listings. Zero values fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    page: u32,
    limit: u32,
}

impl Pagination {
    pub const DEFAULT_PAGE: u32 = 1;
    pub const DEFAULT_LIMIT: u32 = 10;
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(Self::DEFAULT_PAGE);
        let limit = limit
            .filter(|l| *l > 0)
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT);
        Self { page, limit }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Number of items to skip.
    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.limit as usize
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(self.limit as u64)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}
