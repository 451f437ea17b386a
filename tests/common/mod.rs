//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use maestro_offline::cache::MemoryCacheStorage;
use maestro_offline::clock::ManualClock;
use maestro_offline::network::{MemoryNetwork, Network};
use maestro_offline::{
    ControllerConfig, FetchRequest, FetchResponse, Page, Result, WorkerHost,
};

pub const ORIGIN: &str = "https://quiz.example";

/// 2024-01-01T00:00:00Z
pub const START_MS: i64 = 1_704_067_200_000;

pub fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
}

pub fn config(version: &str, manifest: &[&str], skip_waiting_on_install: bool) -> ControllerConfig {
    ControllerConfig {
        origin: url::Url::parse(ORIGIN).unwrap(),
        manifest: manifest.iter().map(|p| p.to_string()).collect(),
        skip_waiting_on_install,
        ..ControllerConfig::default()
    }
    .with_version(version)
}

/// Storage, origin, clock and a host wired together
pub struct Fixture {
    pub storage: Arc<MemoryCacheStorage>,
    pub network: Arc<MemoryNetwork>,
    pub clock: Arc<ManualClock>,
    pub host: WorkerHost,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_network(Arc::new(MemoryNetwork::new()))
    }

    pub fn with_network(network: Arc<MemoryNetwork>) -> Self {
        let storage = Arc::new(MemoryCacheStorage::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let host = WorkerHost::new(storage.clone(), network.clone(), clock.clone());
        Self {
            storage,
            network,
            clock,
            host,
        }
    }

    /// Serve a small HTML body for each shell path
    pub fn serve_shell(&self, paths: &[&str]) {
        for path in paths {
            self.network.serve(
                &url(path),
                FetchResponse::ok("text/html", format!("<html>{}</html>", path)),
            );
        }
    }
}

/// Page that counts reloads
#[derive(Default)]
pub struct CountingPage {
    reloads: AtomicUsize,
}

impl CountingPage {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl Page for CountingPage {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Network that hangs every fetch while stalled
pub struct StallingNetwork {
    inner: MemoryNetwork,
    stalled: AtomicBool,
}

impl StallingNetwork {
    pub fn new(inner: MemoryNetwork) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &MemoryNetwork {
        &self.inner
    }

    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Network for StallingNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.fetch(request).await
    }
}

/// Network that holds each fetch until `parties` fetches are in flight
pub struct BarrierNetwork {
    inner: Arc<MemoryNetwork>,
    barrier: tokio::sync::Barrier,
}

impl BarrierNetwork {
    pub fn new(inner: Arc<MemoryNetwork>, parties: usize) -> Self {
        Self {
            inner,
            barrier: tokio::sync::Barrier::new(parties),
        }
    }
}

#[async_trait]
impl Network for BarrierNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.barrier.wait().await;
        self.inner.fetch(request).await
    }
}

/// Yield until `condition` holds, giving spawned tasks a chance to run
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    condition()
}
