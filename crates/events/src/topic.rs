//! Topic routing keys.
//!
//! A topic is a dot-separated routing key (`post.created`). Bindings use the
//! same syntax plus two wildcards, as a topic exchange does:
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! Every binding in use today is an exact key, so routing behaves as direct
//! addressing; the wildcards exist so a consumer can bind `post.#`.

use serde::{Deserialize, Serialize};

use postrelay_core::DomainError;

/// Routing key for `post.created`.
pub const POST_CREATED: &str = "post.created";
/// Routing key for `post.deleted`.
pub const POST_DELETED: &str = "post.deleted";

/// Suffix appended to a topic when a message is dead-lettered.
pub const DEAD_LETTER_SUFFIX: &str = "dead-letter";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Parse a concrete routing key (no wildcards).
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        validate(&raw, false)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic used to park messages whose handler kept failing.
    pub fn dead_letter(&self) -> Self {
        Self(format!("{}.{}", self.0, DEAD_LETTER_SUFFIX))
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}

/// Binding pattern that catches the dead letters of everything `pattern` binds.
pub fn dead_letter_pattern(pattern: &str) -> String {
    format!("{pattern}.{DEAD_LETTER_SUFFIX}")
}

/// Validate a binding pattern (wildcards allowed).
pub fn validate_pattern(pattern: &str) -> Result<(), DomainError> {
    validate(pattern, true)
}

fn validate(raw: &str, allow_wildcards: bool) -> Result<(), DomainError> {
    if raw.is_empty() {
        return Err(DomainError::validation("topic must not be empty"));
    }
    for word in raw.split('.') {
        if word.is_empty() {
            return Err(DomainError::validation(format!("topic {raw:?} has an empty word")));
        }
        let wildcard = word == "*" || word == "#";
        if wildcard && !allow_wildcards {
            return Err(DomainError::validation(format!(
                "routing key {raw:?} must not contain wildcards"
            )));
        }
        if !wildcard && word.chars().any(|c| c == '*' || c == '#' || c.is_whitespace()) {
            return Err(DomainError::validation(format!("topic {raw:?} has an invalid word")));
        }
    }
    Ok(())
}

/// True if `pattern` is free of wildcards.
pub fn is_exact(pattern: &str) -> bool {
    !pattern.split('.').any(|w| w == "*" || w == "#")
}

/// Topic-exchange matching of a routing key against a binding pattern.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_keys_route_directly() {
        assert!(matches("post.created", "post.created"));
        assert!(!matches("post.created", "post.deleted"));
        assert!(!matches("post", "post.created"));
    }

    #[test]
    fn wildcards_follow_topic_exchange_rules() {
        assert!(matches("post.*", "post.deleted"));
        assert!(!matches("post.*", "post.deleted.dead-letter"));
        assert!(matches("post.#", "post.deleted.dead-letter"));
        assert!(matches("post.#", "post"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("*.deleted", "post.deleted"));
    }

    #[test]
    fn routing_keys_reject_wildcards() {
        assert!(Topic::parse("post.*").is_err());
        assert!(Topic::parse("post..created").is_err());
        assert!(Topic::parse("").is_err());
        assert!(validate_pattern("post.#").is_ok());
        assert!(validate_pattern("po#st").is_err());
    }

    #[test]
    fn dead_letter_topic_is_derived() {
        let deleted = Topic::parse(POST_DELETED).unwrap();
        assert_eq!(deleted.dead_letter().as_str(), "post.deleted.dead-letter");
        for pattern in ["post.deleted", "post.*", "#"] {
            assert!(matches(&dead_letter_pattern(pattern), deleted.dead_letter().as_str()));
        }
        assert!(!matches(&dead_letter_pattern("post.created"), deleted.dead_letter().as_str()));
        assert!(is_exact("post.deleted"));
        assert!(!is_exact("post.*"));
    }
}
