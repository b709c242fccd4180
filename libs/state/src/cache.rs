//! Shared TTL cache
//!
//! The cache coordinates freshness between one writer instance and any number
//! of readers. Keys are namespaced per integration and network so values from
//! different sources never collide.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// `{namespace}_{network}_{key}`, lowercased
pub fn cache_key(namespace: &str, network: u64, key: &str) -> String {
    format!("{}_{}_{}", namespace, network, key).to_lowercase()
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Backend(String),

    #[error("Cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Value under the key, `None` when missing or expired
    async fn get(&self, namespace: &str, network: u64, key: &str)
        -> Result<Option<String>, CacheError>;

    /// Store a value that expires after `ttl_secs`
    async fn setex(
        &self,
        namespace: &str,
        network: u64,
        key: &str,
        ttl_secs: u64,
        value: String,
    ) -> Result<(), CacheError>;
}

/// Read and deserialize a JSON value; undecodable values count as missing
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn SharedCache,
    namespace: &str,
    network: u64,
    key: &str,
) -> Result<Option<T>, CacheError> {
    let Some(raw) = cache.get(namespace, network, key).await? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(
                "Ignoring undecodable cache value {}: {}",
                cache_key(namespace, network, key),
                e
            );
            Ok(None)
        }
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn SharedCache,
    namespace: &str,
    network: u64,
    key: &str,
    ttl_secs: u64,
    value: &T,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.setex(namespace, network, key, ttl_secs, raw).await
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-process [`SharedCache`] on the tokio clock
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(
        &self,
        namespace: &str,
        network: u64,
        key: &str,
    ) -> Result<Option<String>, CacheError> {
        let key = cache_key(namespace, network, key);
        let now = Instant::now();

        let expired = match self.entries.get(&key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        // The read guard above must be gone before removing
        if expired {
            self.entries.remove_if(&key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn setex(
        &self,
        namespace: &str,
        network: u64,
        key: &str,
        ttl_secs: u64,
        value: String,
    ) -> Result<(), CacheError> {
        self.entries.insert(
            cache_key(namespace, network, key),
            CacheEntry {
                value,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }
}
