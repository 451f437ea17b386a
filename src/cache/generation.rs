//! Cache generations
//!
//! A generation is one named cache scoped to a resource class and a deployed
//! version: `{prefix}-{class}-v{version}`. Three are live per version.
//!
//! [`Generation`] wraps a storage handle for one generation and swallows
//! storage failures: they are logged and read as a miss, so a broken cache
//! never breaks the fetch pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{Cache, CacheStorage};
use crate::fetch::FetchResponse;

/// Resource class a generation holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationClass {
    /// App shell, fonts, long-lived assets
    Static,
    /// Pages and other short-lived content
    Dynamic,
    /// Audio previews
    Audio,
}

impl GenerationClass {
    pub const ALL: [GenerationClass; 3] = [Self::Static, Self::Dynamic, Self::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for GenerationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Naming scheme for one (prefix, version) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationNames {
    prefix: String,
    version: String,
}

impl GenerationNames {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            version: version.to_string(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `{prefix}-{class}-v{version}`
    pub fn name(&self, class: GenerationClass) -> String {
        format!("{}-{}-v{}", self.prefix, class, self.version)
    }

    /// The three generation names of the current version
    pub fn current(&self) -> Vec<String> {
        GenerationClass::ALL.iter().map(|c| self.name(*c)).collect()
    }

    /// Whether `name` follows this application's naming convention
    pub fn is_owned(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.prefix))
    }

    /// Owned by this application but not one of the current version's names
    pub fn is_stale(&self, name: &str) -> bool {
        self.is_owned(name) && !GenerationClass::ALL.iter().any(|c| self.name(*c) == name)
    }
}

/// Failure-tolerant handle to one generation
#[derive(Clone)]
pub struct Generation {
    name: String,
    storage: Arc<dyn CacheStorage>,
}

impl Generation {
    pub fn new(name: String, storage: Arc<dyn CacheStorage>) -> Self {
        Self { name, storage }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Option<Arc<dyn Cache>> {
        match self.storage.open(&self.name).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(cache = %self.name, "Failed to open cache: {}", e);
                None
            }
        }
    }

    /// Stored response for `key`, `None` on miss or storage failure
    pub async fn lookup(&self, key: &str) -> Option<FetchResponse> {
        let cache = self.open().await?;
        match cache.match_url(key).await {
            Ok(Some(response)) => {
                debug!(cache = %self.name, key = key, "Cache hit");
                Some(response)
            }
            Ok(None) => {
                debug!(cache = %self.name, key = key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(cache = %self.name, key = key, "Cache read failed: {}", e);
                None
            }
        }
    }

    /// Store `response`; returns whether it was persisted
    pub async fn store(&self, key: &str, response: FetchResponse) -> bool {
        let Some(cache) = self.open().await else {
            return false;
        };
        match cache.put(key, response).await {
            Ok(()) => true,
            Err(e) => {
                warn!(cache = %self.name, key = key, "Cache write failed: {}", e);
                false
            }
        }
    }

    /// Delete the entry for `key`; returns whether one was removed
    pub async fn evict(&self, key: &str) -> bool {
        let Some(cache) = self.open().await else {
            return false;
        };
        match cache.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(cache = %self.name, key = key, "Cache delete failed: {}", e);
                false
            }
        }
    }

    /// All stored keys, empty on storage failure
    pub async fn keys(&self) -> Vec<String> {
        let Some(cache) = self.open().await else {
            return Vec::new();
        };
        cache.keys().await.unwrap_or_else(|e| {
            warn!(cache = %self.name, "Cache key listing failed: {}", e);
            Vec::new()
        })
    }
}
