//! Redis-backed response cache.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{instrument, warn};

use super::store::{CacheError, CacheStore};

const SCAN_BATCH: usize = 200;

/// Cache over one lazily (re)opened Redis connection.
///
/// A connection error drops the connection; the next call reconnects.
pub struct RedisCache {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl core::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

fn map_err(e: redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        CacheError::Unavailable(e.to_string())
    } else {
        CacheError::Command(e.to_string())
    }
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN MATCH.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('*');
    out
}

impl RedisCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn with_conn<R>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<R>,
    ) -> Result<R, CacheError> {
        let mut guard: MutexGuard<'_, Option<redis::Connection>> =
            self.conn.lock().map_err(|_| CacheError::Poisoned)?;

        if guard.is_none() {
            let conn = self.client.get_connection().map_err(map_err)?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(CacheError::Unavailable("no connection".into()));
        };

        match op(conn) {
            Ok(r) => Ok(r),
            Err(e) => {
                let err = map_err(e);
                if matches!(err, CacheError::Unavailable(_)) {
                    warn!(error = %err, "redis cache connection lost");
                    *guard = None;
                }
                Err(err)
            }
        }
    }
}

impl CacheStore for RedisCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_conn(|c| redis::cmd("GET").arg(key).query(c))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let millis = ttl.as_millis() as u64;
        if millis == 0 {
            return Err(CacheError::InvalidTtl);
        }
        self.with_conn(|c| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis)
                .query::<()>(c)
        })
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let removed: u64 = self.with_conn(|c| redis::cmd("DEL").arg(key).query(c))?;
        Ok(removed > 0)
    }

    #[instrument(skip(self), err)]
    fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let pattern = glob_escape(prefix);
        self.with_conn(|c| {
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query(c)?;
                if !keys.is_empty() {
                    let n: u64 = redis::cmd("DEL").arg(&keys[..]).query(c)?;
                    removed += n;
                }
                if next == 0 {
                    return Ok(removed);
                }
                cursor = next;
            }
        })
    }
}
