//! Disk-backed cache storage
//!
//! Layout under the storage root:
//!
//! ```text
//! {root}/{urlencoded cache name}/{sha256(url)}.entry
//! ```
//!
//! An entry file is a big-endian `u32` metadata length, the JSON metadata
//! (url, status, headers) and then the body. Each write goes to its own temp
//! file and is renamed over the entry, so readers see one whole entry and
//! concurrent writers to a key end with the last rename winning.

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::storage::{Cache, CacheStorage};
use crate::fetch::FetchResponse;
use crate::types::{OfflineError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
}

impl EntryMeta {
    fn from_response(url: &str, response: &FetchResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            url: url.to_string(),
            status: response.status.as_u16(),
            headers,
        }
    }

    fn into_response(self, body: Bytes) -> Result<FetchResponse> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| OfflineError::Storage(format!("Invalid stored status: {}", e)))?;
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Skipping unreadable stored header"),
            }
        }
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

const ENTRY_EXT: &str = "entry";

fn encode_entry(meta: &EntryMeta, body: &[u8]) -> Result<Vec<u8>> {
    let meta = serde_json::to_vec(meta)?;
    let len = u32::try_from(meta.len())
        .map_err(|_| OfflineError::Storage("Entry metadata too large".into()))?;
    let mut framed = Vec::with_capacity(4 + meta.len() + body.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&meta);
    framed.extend_from_slice(body);
    Ok(framed)
}

fn decode_entry(mut framed: Vec<u8>) -> Result<(EntryMeta, Bytes)> {
    let corrupt = || OfflineError::Storage("Truncated cache entry".into());
    let len_bytes: [u8; 4] = framed
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(corrupt)?;
    let meta_end = 4 + u32::from_be_bytes(len_bytes) as usize;
    if framed.len() < meta_end {
        return Err(corrupt());
    }
    let meta: EntryMeta = serde_json::from_slice(&framed[4..meta_end])?;
    let body = Bytes::from(framed.split_off(meta_end));
    Ok((meta, body))
}

fn entry_stem(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// One cache directory
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    fn entry_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", stem, ENTRY_EXT))
    }

    fn temp_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.tmp", stem, Uuid::new_v4().simple()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn match_url(&self, key: &str) -> Result<Option<FetchResponse>> {
        let stem = entry_stem(key);
        let Some(framed) = read_optional(&self.entry_path(&stem)).await? else {
            return Ok(None);
        };
        let (meta, body) = decode_entry(framed)?;
        meta.into_response(body).map(Some)
    }

    async fn put(&self, key: &str, response: FetchResponse) -> Result<()> {
        let stem = entry_stem(key);
        let framed = encode_entry(&EntryMeta::from_response(key, &response), &response.body)?;

        fs::create_dir_all(&self.dir).await?;
        let tmp = self.temp_path(&stem);
        if let Err(e) = fs::write(&tmp, framed).await {
            let _ = remove_optional(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, self.entry_path(&stem)).await {
            let _ = remove_optional(&tmp).await;
            return Err(e.into());
        }

        debug!(key = key, bytes = response.body.len(), "Stored entry on disk");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        remove_optional(&self.entry_path(&entry_stem(key))).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let Some(framed) = read_optional(&path).await? else {
                continue;
            };
            match decode_entry(framed) {
                Ok((meta, _)) => keys.push(meta.url),
                Err(e) => warn!(path = %path.display(), "Unreadable cache metadata: {}", e),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Cache storage rooted at a directory
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        self.root.join(urlencoding::encode(name).into_owned())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        let dir = self.cache_dir(name);
        fs::create_dir_all(&dir).await?;
        Ok(Arc::new(DiskCache { dir }))
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.cache_dir(name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        match fs::remove_dir_all(self.cache_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let raw = entry.file_name();
            let Some(raw) = raw.to_str() else { continue };
            match urlencoding::decode(raw) {
                Ok(name) => names.push(name.into_owned()),
                Err(e) => warn!(dir = raw, "Skipping undecodable cache directory: {}", e),
            }
        }
        names.sort();
        Ok(names)
    }
}
