//! Network access
//!
//! The controller only sees the [`Network`] trait. [`HttpNetwork`] talks to a
//! real origin through reqwest; [`MemoryNetwork`] is an in-process origin that
//! can be switched offline, used for simulation and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use hyper::StatusCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::fetch::{FetchRequest, FetchResponse};
use crate::types::{OfflineError, Result};

/// Performs a network fetch.
///
/// A non-2xx answer is still `Ok`; only transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// reqwest-backed network
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Create a client whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(url = %request.url, status = status.as_u16(), "Network fetch");

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// In-process origin
#[derive(Default)]
pub struct MemoryNetwork {
    /// cache key -> response served for it
    routes: DashMap<String, FetchResponse>,
    /// URLs whose fetch fails even when online
    broken: DashMap<String, ()>,
    offline: AtomicBool,
    calls: AtomicUsize,
    calls_by_url: DashMap<String, usize>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for `url`
    pub fn serve(&self, url: &str, response: FetchResponse) {
        self.routes.insert(url.to_string(), response);
    }

    /// Make fetches of `url` fail with a transport error
    pub fn break_url(&self, url: &str) {
        self.broken.insert(url.to_string(), ());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total fetches attempted, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls_by_url.get(url).map(|c| *c).unwrap_or(0)
    }

    /// Every request seen, in arrival order
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let key = request.cache_key();
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_url.entry(key.clone()).or_insert(0) += 1;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(OfflineError::Network(format!("offline: {}", key)));
        }
        if self.broken.contains_key(&key) {
            return Err(OfflineError::Network(format!("connection refused: {}", key)));
        }

        Ok(self
            .routes
            .get(&key)
            .map(|r| r.clone())
            .unwrap_or_else(|| FetchResponse::new(StatusCode::NOT_FOUND, "Not Found")))
    }
}
