//! Environment-driven configuration for relay nodes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::broker::BackoffPolicy;
use crate::workers::AckPolicy;

pub const ENV_BROKER_URL: &str = "POSTRELAY_BROKER_URL";
pub const ENV_CACHE_URL: &str = "POSTRELAY_CACHE_URL";
pub const ENV_EXCHANGE: &str = "POSTRELAY_EXCHANGE";
pub const ENV_SERVICE: &str = "POSTRELAY_SERVICE";
pub const ENV_CONSUMER_NAME: &str = "POSTRELAY_CONSUMER_NAME";
pub const ENV_CONNECT_ATTEMPTS: &str = "POSTRELAY_CONNECT_ATTEMPTS";
pub const ENV_BACKOFF_INITIAL_MS: &str = "POSTRELAY_BACKOFF_INITIAL_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "POSTRELAY_BACKOFF_MAX_MS";
pub const ENV_ACK_POLICY: &str = "POSTRELAY_ACK_POLICY";
pub const ENV_DATABASE_URL: &str = "POSTRELAY_DATABASE_URL";
pub const ENV_BLOB_DIR: &str = "POSTRELAY_BLOB_DIR";
/// Set by container runtimes and most shells; part of the default consumer name.
pub const ENV_HOSTNAME: &str = "HOSTNAME";

pub const DEFAULT_EXCHANGE: &str = "postrelay_events";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Where a broker or cache lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Process-local, for development and tests.
    Memory,
    Redis(String),
}

impl Endpoint {
    fn parse(var: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw == "memory://" || raw.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else if raw.starts_with("redis://") || raw.starts_with("rediss://") {
            Ok(Self::Redis(raw.to_string()))
        } else {
            Err(ConfigError::invalid(
                var,
                format!("expected memory:// or redis://..., got {raw:?}"),
            ))
        }
    }
}

/// Which consumer services a node hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Search,
    Media,
    All,
}

impl ServiceRole {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "media" => Ok(Self::Media),
            "all" => Ok(Self::All),
            other => Err(ConfigError::invalid(
                ENV_SERVICE,
                format!("expected search, media or all, got {other:?}"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Media => "media",
            Self::All => "all",
        }
    }

    pub fn hosts_search(&self) -> bool {
        matches!(self, Self::Search | Self::All)
    }

    pub fn hosts_media(&self) -> bool {
        matches!(self, Self::Media | Self::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub broker: Endpoint,
    pub cache: Endpoint,
    pub exchange: String,
    pub service: ServiceRole,
    pub consumer_name: String,
    pub backoff: BackoffPolicy,
    pub ack_policy: AckPolicy,
    pub database_url: Option<String>,
    pub blob_dir: Option<PathBuf>,
}

fn parse_number<T: core::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, format!("not a number: {raw:?}")))
}

fn positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let n: u64 = parse_number(var, raw)?;
    if n == 0 {
        return Err(ConfigError::invalid(var, "must be greater than zero"));
    }
    Ok(n)
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; unset and blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        let broker = match get(ENV_BROKER_URL) {
            Some(v) => Endpoint::parse(ENV_BROKER_URL, &v)?,
            None => Endpoint::Memory,
        };
        let cache = match get(ENV_CACHE_URL) {
            Some(v) => Endpoint::parse(ENV_CACHE_URL, &v)?,
            None => Endpoint::Memory,
        };
        let exchange = get(ENV_EXCHANGE)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
        let service = match get(ENV_SERVICE) {
            Some(v) => ServiceRole::parse(&v)?,
            None => ServiceRole::All,
        };
        // Stable across restarts so a restarted consumer reclaims its own
        // pending entries at once instead of after the idle timeout.
        let consumer_name = get(ENV_CONSUMER_NAME)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| {
                let host = get(ENV_HOSTNAME).map(|h| h.trim().to_string());
                format!("{}-{}", service.as_str(), host.as_deref().unwrap_or("localhost"))
            });

        let defaults = BackoffPolicy::default();
        let max_attempts = match get(ENV_CONNECT_ATTEMPTS) {
            Some(v) => u32::try_from(positive(ENV_CONNECT_ATTEMPTS, &v)?)
                .map_err(|_| ConfigError::invalid(ENV_CONNECT_ATTEMPTS, "too large"))?,
            None => defaults.max_attempts,
        };
        let initial = match get(ENV_BACKOFF_INITIAL_MS) {
            Some(v) => Duration::from_millis(positive(ENV_BACKOFF_INITIAL_MS, &v)?),
            None => defaults.initial,
        };
        let max = match get(ENV_BACKOFF_MAX_MS) {
            Some(v) => Duration::from_millis(positive(ENV_BACKOFF_MAX_MS, &v)?),
            None => defaults.max,
        };
        if max < initial {
            return Err(ConfigError::invalid(
                ENV_BACKOFF_MAX_MS,
                "must not be below the initial backoff",
            ));
        }

        let ack_policy = match get(ENV_ACK_POLICY) {
            Some(v) => AckPolicy::parse(&v).map_err(|e| ConfigError::invalid(ENV_ACK_POLICY, e))?,
            None => AckPolicy::Always,
        };

        Ok(Self {
            broker,
            cache,
            exchange,
            service,
            consumer_name,
            backoff: BackoffPolicy {
                initial,
                max,
                max_attempts,
            },
            ack_policy,
            database_url: get(ENV_DATABASE_URL),
            blob_dir: get(ENV_BLOB_DIR).map(|v| PathBuf::from(v.trim())),
        })
    }
}
