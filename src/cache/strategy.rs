//! Caching strategies
//!
//! Each strategy reads and writes one [`Generation`]. Storage failures are
//! already absorbed by the generation handle; only network failures with no
//! usable cached entry come back as errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::expiry::{millis, stamped, Stamp};
use super::generation::Generation;
use crate::clock::Clock;
use crate::fetch::{FetchRequest, FetchResponse};
use crate::network::Network;
use crate::types::Result;

/// Read/write policy applied to a classified request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Strategy {
    /// Serve any cached entry, fetch and store on miss
    CacheFirst,
    /// Serve cached entries younger than `max_age`, refetch and re-stamp otherwise
    CacheFirstWithExpiration { max_age: Duration },
    /// Always try the network; offline, serve entries younger than twice `max_age`
    NetworkFirstWithExpiration { max_age: Duration },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::CacheFirstWithExpiration { .. } => "cache-first-with-expiration",
            Self::NetworkFirstWithExpiration { .. } => "network-first-with-expiration",
        }
    }

    /// Run the strategy for `request` against `generation`
    pub async fn execute(
        &self,
        request: &FetchRequest,
        generation: &Generation,
        network: &dyn Network,
        clock: &dyn Clock,
    ) -> Result<FetchResponse> {
        match *self {
            Self::CacheFirst => cache_first(request, generation, network).await,
            Self::CacheFirstWithExpiration { max_age } => {
                cache_first_with_expiration(request, generation, network, clock, max_age).await
            }
            Self::NetworkFirstWithExpiration { max_age } => {
                network_first_with_expiration(request, generation, network, clock, max_age).await
            }
        }
    }
}

pub async fn cache_first(
    request: &FetchRequest,
    generation: &Generation,
    network: &dyn Network,
) -> Result<FetchResponse> {
    let key = request.cache_key();
    if let Some(cached) = generation.lookup(&key).await {
        return Ok(cached);
    }

    let response = network.fetch(request).await.map_err(|e| {
        warn!(url = %key, "Network failed: {}", e);
        e
    })?;

    if response.is_ok() {
        generation.store(&key, response.clone()).await;
    }
    Ok(response)
}

pub async fn cache_first_with_expiration(
    request: &FetchRequest,
    generation: &Generation,
    network: &dyn Network,
    clock: &dyn Clock,
    max_age: Duration,
) -> Result<FetchResponse> {
    let key = request.cache_key();
    let cached = generation.lookup(&key).await;

    if let Some(ref entry) = cached {
        if Stamp::of(entry).is_within(clock.now_ms(), max_age) {
            return Ok(entry.clone());
        }
        debug!(cache = generation.name(), key = %key, "Cached entry expired");
        generation.evict(&key).await;
    }

    match network.fetch(request).await {
        Ok(response) => {
            if response.is_ok() {
                generation
                    .store(&key, stamped(&response, clock.now_ms()))
                    .await;
            }
            Ok(response)
        }
        Err(e) => {
            warn!(url = %key, "Network failed: {}", e);
            // Stale but present beats failing outright
            cached.ok_or(e)
        }
    }
}

pub async fn network_first_with_expiration(
    request: &FetchRequest,
    generation: &Generation,
    network: &dyn Network,
    clock: &dyn Clock,
    max_age: Duration,
) -> Result<FetchResponse> {
    let key = request.cache_key();

    match network.fetch(request).await {
        Ok(response) => {
            if response.is_ok() {
                generation
                    .store(&key, stamped(&response, clock.now_ms()))
                    .await;
            }
            Ok(response)
        }
        Err(e) => {
            warn!(url = %key, "Network failed, trying cache: {}", e);

            // Offline tolerance is twice the read-path max age
            let offline_max_age = Duration::from_millis(millis(max_age).saturating_mul(2) as u64);
            match generation.lookup(&key).await {
                Some(entry) if Stamp::of(&entry).is_within(clock.now_ms(), offline_max_age) => {
                    Ok(entry)
                }
                _ => Err(e),
            }
        }
    }
}
