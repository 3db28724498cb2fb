//! Cache Service
//!
//! A shared key-value store with per-key expiry. Only single-key operations
//! are atomic; there are no transactions. Single-flight lock keys and cached
//! validation results live here.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Remaining lifetime of a key, with the Redis `PTTL` conventions
/// (`-2` missing, `-1` no expiry) lifted into an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl CacheTtl {
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            -2 => CacheTtl::Missing,
            n if n < 0 => CacheTtl::Persistent,
            n => CacheTtl::Expires(Duration::from_millis(n as u64)),
        }
    }

    pub fn as_millis(&self) -> i64 {
        match self {
            CacheTtl::Missing => -2,
            CacheTtl::Persistent => -1,
            CacheTtl::Expires(d) => d.as_millis() as i64,
        }
    }
}

#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Stores `value` only if `key` is absent. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn ttl(&self, key: &str) -> Result<CacheTtl, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Keys matching a Redis-style glob (`*`, `?`, `[abc]`, `\` escapes).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    async fn ping(&self) -> Result<bool, CacheError>;

    /// Printable description of the connection, without credentials.
    fn connection_repr(&self) -> String;
}

/// Translates a Redis glob into an anchored regular expression.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut expr = String::from("^");
    let mut chars = pattern.chars();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match (c, in_class) {
            ('\\', _) => match chars.next() {
                Some(escaped) => expr.push_str(&regex::escape(&escaped.to_string())),
                None => expr.push_str(r"\\"),
            },
            (']', true) => {
                in_class = false;
                expr.push(']');
            }
            ('^', true) | ('-', true) => expr.push(c),
            (_, true) => expr.push_str(&regex::escape(&c.to_string())),
            ('*', false) => expr.push_str(".*"),
            ('?', false) => expr.push('.'),
            ('[', false) => {
                in_class = true;
                expr.push('[');
            }
            (_, false) => expr.push_str(&regex::escape(&c.to_string())),
        }
    }

    if in_class {
        return Err(CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            message: "unterminated character class".to_string(),
        });
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local cache. Expired keys are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.value().clone();
        if entry.is_live(now) {
            Some(entry)
        } else {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            None
        }
    }
}

#[async_trait]
impl CacheService for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        // The entry guard holds the shard lock, so check and insert are one step.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(Instant::now()) {
                    Ok(false)
                } else {
                    occupied.insert(CacheEntry::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn ttl(&self, key: &str) -> Result<CacheTtl, CacheError> {
        let Some(entry) = self.live(key) else {
            return Ok(CacheTtl::Missing);
        };
        Ok(match entry.expires_at {
            None => CacheTtl::Persistent,
            Some(at) => CacheTtl::Expires(at.saturating_duration_since(Instant::now())),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<bool, CacheError> {
        Ok(true)
    }

    fn connection_repr(&self) -> String {
        "memory://".to_string()
    }
}
