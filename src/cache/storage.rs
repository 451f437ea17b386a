//! Cache storage traits and the in-memory implementation
//!
//! Mirrors the browser Cache API: a [`CacheStorage`] holds named caches, a
//! [`Cache`] maps request URLs to responses. All operations are async and
//! fallible so that disk-backed storage fits the same seam.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::fetch::FetchResponse;
use crate::types::Result;

/// One named cache
#[async_trait]
pub trait Cache: Send + Sync {
    /// Look up the response stored for `key`
    async fn match_url(&self, key: &str) -> Result<Option<FetchResponse>>;

    /// Store `response` under `key`, replacing any previous entry
    async fn put(&self, key: &str, response: FetchResponse) -> Result<()>;

    /// Remove the entry for `key`; returns whether one existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Process-wide collection of named caches
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if missing
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>>;

    async fn has(&self, name: &str) -> Result<bool>;

    /// Delete a whole cache; returns whether it existed
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Names of all caches, sorted
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory cache
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, FetchResponse>,
}

impl MemoryCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn match_url(&self, key: &str) -> Result<Option<FetchResponse>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn put(&self, key: &str, response: FetchResponse) -> Result<()> {
        self.entries.insert(key.to_string(), response);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory cache storage
#[derive(Default)]
pub struct MemoryCacheStorage {
    caches: DashMap<String, Arc<MemoryCache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        let cache = self
            .caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = name, "Created cache");
                Arc::new(MemoryCache::default())
            })
            .clone();
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.caches.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.caches.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_put_match() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("maestro-quiz-static-v2.0.0").await.unwrap();

        assert!(cache.match_url("https://quiz.example/").await.unwrap().is_none());
        cache
            .put("https://quiz.example/", FetchResponse::ok("text/html", "home"))
            .await
            .unwrap();

        // Reopening yields the same cache
        let reopened = storage.open("maestro-quiz-static-v2.0.0").await.unwrap();
        let hit = reopened.match_url("https://quiz.example/").await.unwrap().unwrap();
        assert_eq!(hit.body, "home");
        assert_eq!(reopened.keys().await.unwrap(), vec!["https://quiz.example/"]);
    }

    #[tokio::test]
    async fn test_delete_entry_and_cache() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("a").await.unwrap();
        cache.put("k", FetchResponse::ok("text/plain", "v")).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());

        storage.open("b").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["a", "b"]);
        assert!(storage.delete("a").await.unwrap());
        assert!(!storage.has("a").await.unwrap());
        assert!(storage.has("b").await.unwrap());
    }
}
