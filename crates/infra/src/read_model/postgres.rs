//! Postgres-backed projection stores (search index, media assets).
//!
//! The stores are synchronous (consumer runtimes are plain threads) and drives
//! sqlx on a runtime handle supplied by the host. Never call it from inside
//! that runtime's async context.
//!
//! ## Idempotency
//!
//! Inserts and deletes for one post id serialize on a transaction-scoped
//! advisory lock. Insert is `ON CONFLICT DO NOTHING` and refuses tombstoned
//! ids; delete records the tombstone and removes the row in one transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::runtime::Handle;
use tracing::instrument;

use postrelay_core::{MediaId, PostId, UserId};

use super::media::{MediaAsset, MediaStore};
use super::search::{rank, score, terms, SearchHit, SearchRow, SearchStore};
use super::StoreError;

const SEARCH_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS search_posts (
        post_id    TEXT PRIMARY KEY,
        user_id    TEXT NOT NULL,
        content    TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_tombstones (
        post_id    TEXT PRIMARY KEY,
        deleted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

const MEDIA_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS media_assets (
        media_id      TEXT PRIMARY KEY,
        public_id     TEXT NOT NULL,
        url           TEXT NOT NULL,
        original_name TEXT NOT NULL,
        mime_type     TEXT NOT NULL,
        user_id       TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS media_assets_user_idx ON media_assets (user_id, created_at)",
];

async fn connect_pool(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(backend)
}

async fn apply(pool: &PgPool, ddl: &[&str]) -> Result<(), StoreError> {
    for stmt in ddl {
        sqlx::query(stmt).execute(pool).await.map_err(backend)?;
    }
    Ok(())
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Escape LIKE metacharacters; `\` is Postgres' default LIKE escape.
fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn row_to_search_row(row: &PgRow) -> Result<SearchRow, StoreError> {
    let post_id: String = row.try_get("post_id").map_err(backend)?;
    let user_id: String = row.try_get("user_id").map_err(backend)?;
    let content: String = row.try_get("content").map_err(backend)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(backend)?;

    Ok(SearchRow {
        post_id: PostId::parse(post_id).map_err(|e| StoreError::Backend(e.to_string()))?,
        user_id: UserId::parse(user_id).map_err(|e| StoreError::Backend(e.to_string()))?,
        content,
        created_at,
    })
}

pub struct PostgresSearchStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl core::fmt::Debug for PostgresSearchStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresSearchStore").finish_non_exhaustive()
    }
}

impl PostgresSearchStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Connect, then create the tables if missing.
    pub async fn connect(database_url: &str, handle: Handle) -> Result<Self, StoreError> {
        let store = Self::new(connect_pool(database_url).await?, handle);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        apply(&self.pool, SEARCH_SCHEMA).await
    }
}

impl SearchStore for PostgresSearchStore {
    #[instrument(skip(self, row), fields(post_id = %row.post_id), err)]
    fn insert_if_absent(&self, row: SearchRow) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let mut tx = pool.begin().await.map_err(backend)?;
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(row.post_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO search_posts (post_id, user_id, content, created_at)
                SELECT $1, $2, $3, $4
                WHERE NOT EXISTS (SELECT 1 FROM search_tombstones WHERE post_id = $1)
                ON CONFLICT (post_id) DO NOTHING
                "#,
            )
            .bind(row.post_id.as_str())
            .bind(row.user_id.as_str())
            .bind(&row.content)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

            tx.commit().await.map_err(backend)?;
            Ok(inserted == 1)
        })
    }

    #[instrument(skip(self), err)]
    fn delete_post(&self, post_id: &PostId) -> Result<usize, StoreError> {
        let pool = self.pool.clone();
        let id = post_id.as_str().to_string();
        self.handle.block_on(async move {
            let mut tx = pool.begin().await.map_err(backend)?;
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            sqlx::query(
                "INSERT INTO search_tombstones (post_id) VALUES ($1) ON CONFLICT (post_id) DO NOTHING",
            )
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
            let removed = sqlx::query("DELETE FROM search_posts WHERE post_id = $1")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?
                .rows_affected();

            tx.commit().await.map_err(backend)?;
            Ok(removed as usize)
        })
    }

    fn get(&self, post_id: &PostId) -> Result<Option<SearchRow>, StoreError> {
        let pool = self.pool.clone();
        let id = post_id.as_str().to_string();
        self.handle.block_on(async move {
            let row = sqlx::query(
                "SELECT post_id, user_id, content, created_at FROM search_posts WHERE post_id = $1",
            )
            .bind(&id)
            .fetch_optional(&*pool)
            .await
            .map_err(backend)?;
            row.as_ref().map(row_to_search_row).transpose()
        })
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let patterns: Vec<String> = query_terms.iter().map(|t| like_pattern(t)).collect();

        let pool = self.pool.clone();
        let rows = self.handle.block_on(async move {
            sqlx::query(
                r#"
                SELECT post_id, user_id, content, created_at
                FROM search_posts
                WHERE content ILIKE ANY($1)
                "#,
            )
            .bind(&patterns)
            .fetch_all(&*pool)
            .await
            .map_err(backend)
        })?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let row = row_to_search_row(row)?;
            let score = score(&row.content, &query_terms);
            if score > 0 {
                hits.push(SearchHit { row, score });
            }
        }
        Ok(rank(hits, limit))
    }

    fn count(&self) -> Result<usize, StoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_posts")
                .fetch_one(&*pool)
                .await
                .map_err(backend)?;
            Ok(n as usize)
        })
    }

    #[instrument(skip(self), err)]
    fn prune_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let pruned = sqlx::query("DELETE FROM search_tombstones WHERE deleted_at < $1")
                .bind(deleted_before)
                .execute(&*pool)
                .await
                .map_err(backend)?
                .rows_affected();
            Ok(pruned as usize)
        })
    }
}

fn row_to_media_asset(row: &PgRow) -> Result<MediaAsset, StoreError> {
    let id = |col: &str| -> Result<String, StoreError> { row.try_get(col).map_err(backend) };
    Ok(MediaAsset {
        media_id: MediaId::parse(id("media_id")?).map_err(|e| StoreError::Backend(e.to_string()))?,
        public_id: id("public_id")?,
        url: id("url")?,
        original_name: id("original_name")?,
        mime_type: id("mime_type")?,
        user_id: UserId::parse(id("user_id")?).map_err(|e| StoreError::Backend(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

const MEDIA_COLUMNS: &str =
    "media_id, public_id, url, original_name, mime_type, user_id, created_at";

/// Media asset rows shared by the media service (writes on upload) and the
/// media cleanup consumer (deletes on `post.deleted`).
pub struct PostgresMediaStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl core::fmt::Debug for PostgresMediaStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresMediaStore").finish_non_exhaustive()
    }
}

impl PostgresMediaStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Connect, then create the table if missing.
    pub async fn connect(database_url: &str, handle: Handle) -> Result<Self, StoreError> {
        let store = Self::new(connect_pool(database_url).await?, handle);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        apply(&self.pool, MEDIA_SCHEMA).await
    }
}

impl MediaStore for PostgresMediaStore {
    #[instrument(skip(self, asset), fields(media_id = %asset.media_id), err)]
    fn insert(&self, asset: MediaAsset) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            sqlx::query(&format!(
                "INSERT INTO media_assets ({MEDIA_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ))
            .bind(asset.media_id.as_str())
            .bind(&asset.public_id)
            .bind(&asset.url)
            .bind(&asset.original_name)
            .bind(&asset.mime_type)
            .bind(asset.user_id.as_str())
            .bind(asset.created_at)
            .execute(&*pool)
            .await
            .map_err(backend)?;
            Ok(())
        })
    }

    fn get(&self, id: &MediaId) -> Result<Option<MediaAsset>, StoreError> {
        let pool = self.pool.clone();
        let id = id.as_str().to_string();
        self.handle.block_on(async move {
            let row = sqlx::query(&format!(
                "SELECT {MEDIA_COLUMNS} FROM media_assets WHERE media_id = $1"
            ))
            .bind(&id)
            .fetch_optional(&*pool)
            .await
            .map_err(backend)?;
            row.as_ref().map(row_to_media_asset).transpose()
        })
    }

    #[instrument(skip(self), err)]
    fn delete(&self, id: &MediaId) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let id = id.as_str().to_string();
        self.handle.block_on(async move {
            let removed = sqlx::query("DELETE FROM media_assets WHERE media_id = $1")
                .bind(&id)
                .execute(&*pool)
                .await
                .map_err(backend)?
                .rows_affected();
            Ok(removed > 0)
        })
    }

    fn list_by_user(&self, user: &UserId) -> Result<Vec<MediaAsset>, StoreError> {
        let pool = self.pool.clone();
        let user = user.as_str().to_string();
        let rows = self.handle.block_on(async move {
            sqlx::query(&format!(
                "SELECT {MEDIA_COLUMNS} FROM media_assets WHERE user_id = $1 ORDER BY created_at DESC"
            ))
            .bind(&user)
            .fetch_all(&*pool)
            .await
            .map_err(backend)
        })?;
        rows.iter().map(row_to_media_asset).collect()
    }
}
