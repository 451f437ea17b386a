//! Cache controller
//!
//! One [`CacheController`] exists per deployed version. It owns the version's
//! three generations, pre-warms the app shell at install, purges older
//! versions at activation, answers page messages and decides how every
//! intercepted fetch is served.
//!
//! The controller never reaches into pages directly: claiming pages,
//! promoting past the waiting phase and broadcasting go through the
//! [`ClientScope`] the host hands to it.

pub mod lifecycle;

pub use lifecycle::LifecycleState;

use async_trait::async_trait;
use futures::future::join_all;
use hyper::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{
    sweep_expired, CacheStorage, Generation, GenerationClass, GenerationNames, Route,
    RoutingRules,
};
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::fetch::{FetchRequest, FetchResponse};
use crate::network::Network;
use crate::protocol::{ClearCacheReply, ClientMessage, ControllerMessage, Envelope, VersionReply};
use crate::types::{OfflineError, Result};

/// Host capabilities a controller may use on the pages it serves
#[async_trait]
pub trait ClientScope: Send + Sync {
    /// Promote this controller without waiting for old pages to go away
    async fn skip_waiting(&self);

    /// Take control of every connected page; returns how many changed controller
    async fn claim(&self) -> usize;

    /// Post `message` to every page this controller controls; returns recipients
    async fn broadcast(&self, message: ControllerMessage) -> usize;
}

/// Result of the install phase
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    /// Manifest paths now in the static generation
    pub cached: Vec<String>,
    /// Manifest paths that could not be pre-warmed
    pub failed: Vec<String>,
    /// Whether the controller asked to skip the waiting phase
    pub skip_waiting: bool,
}

/// Result of the activation phase
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationReport {
    /// Stale generations deleted
    pub deleted: Vec<String>,
    /// Pages that switched to this controller
    pub claimed: usize,
    /// Expired entries swept from audio and dynamic generations
    pub expired: usize,
    /// Pages notified of the update
    pub notified: usize,
}

/// What the controller decided for an intercepted fetch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Answer the page with this response
    Respond(FetchResponse),
    /// Not intercepted; the host fetches natively
    Passthrough,
}

pub struct CacheController {
    config: ControllerConfig,
    names: GenerationNames,
    rules: RoutingRules,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<LifecycleState>,
    skip_waiting: AtomicBool,
}

impl CacheController {
    pub fn new(
        config: ControllerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let names = GenerationNames::new(&config.prefix, &config.version);
        let rules = RoutingRules::new(&config.routes, &config.manifest)?;
        let (state, _) = watch::channel(LifecycleState::Parsed);

        Ok(Self {
            config,
            names,
            rules,
            storage,
            network,
            clock,
            state,
            skip_waiting: AtomicBool::new(false),
        })
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn names(&self) -> &GenerationNames {
        &self.names
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe lifecycle changes
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            Some(from) => Err(OfflineError::InvalidState {
                from: from.to_string(),
                to: next.to_string(),
            }),
            None => {
                debug!(version = %self.version(), state = %next, "Lifecycle transition");
                Ok(())
            }
        }
    }

    pub fn request_skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub fn generation(&self, class: GenerationClass) -> Generation {
        Generation::new(self.names.name(class), Arc::clone(&self.storage))
    }

    /// Pre-warm the static generation with every manifest path.
    ///
    /// Each path is fetched independently; a failure is logged and skipped.
    pub async fn install(&self) -> InstallReport {
        info!("Installing version {}", self.version());

        let generation = self.generation(GenerationClass::Static);
        let results = join_all(self.config.manifest.iter().map(|path| {
            let generation = &generation;
            async move { (path.clone(), self.prewarm(generation, path).await) }
        }))
        .await;

        let mut report = InstallReport::default();
        for (path, result) in results {
            match result {
                Ok(()) => report.cached.push(path),
                Err(e) => {
                    warn!("Failed to cache {}: {}", path, e);
                    report.failed.push(path);
                }
            }
        }

        if self.config.skip_waiting_on_install {
            self.request_skip_waiting();
        }
        report.skip_waiting = self.skip_waiting_requested();

        info!(
            version = %self.version(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Static assets cached"
        );
        report
    }

    async fn prewarm(&self, generation: &Generation, path: &str) -> Result<()> {
        let url = self.config.origin.join(path)?;
        let request = FetchRequest::new(Method::GET, url);
        let response = self.network.fetch(&request).await?;
        if !response.is_ok() {
            return Err(OfflineError::Network(format!(
                "{} answered {}",
                request.url, response.status
            )));
        }
        if !generation.store(&request.cache_key(), response).await {
            return Err(OfflineError::Storage(format!("{} not stored", request.url)));
        }
        Ok(())
    }

    /// Purge stale generations, claim pages, sweep expired entries and
    /// announce the new version.
    pub async fn activate(&self, scope: &dyn ClientScope) -> ActivationReport {
        info!("Activating version {}", self.version());

        let deleted = self.delete_stale_generations().await;
        let claimed = scope.claim().await;

        let audio = self.generation(GenerationClass::Audio);
        let dynamic = self.generation(GenerationClass::Dynamic);
        let (audio_expired, dynamic_expired) = tokio::join!(
            sweep_expired(&audio, self.rules.audio_max_age(), self.clock.as_ref()),
            sweep_expired(&dynamic, self.rules.dynamic_max_age(), self.clock.as_ref()),
        );

        let notified = scope
            .broadcast(ControllerMessage::Updated {
                version: self.version().to_string(),
            })
            .await;

        info!(
            version = %self.version(),
            deleted = deleted.len(),
            claimed = claimed,
            notified = notified,
            "Activation complete"
        );

        ActivationReport {
            deleted,
            claimed,
            expired: audio_expired + dynamic_expired,
            notified,
        }
    }

    async fn delete_stale_generations(&self) -> Vec<String> {
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list caches: {}", e);
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for name in names.into_iter().filter(|n| self.names.is_stale(n)) {
            match self.storage.delete(&name).await {
                Ok(_) => {
                    info!("Deleting old cache: {}", name);
                    deleted.push(name);
                }
                Err(e) => warn!("Failed to delete cache {}: {}", name, e),
            }
        }
        deleted
    }

    /// Delete every generation carrying the application prefix, any version
    pub async fn clear_caches(&self) -> bool {
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list caches: {}", e);
                return false;
            }
        };

        let mut success = true;
        for name in names.into_iter().filter(|n| self.names.is_owned(n)) {
            if let Err(e) = self.storage.delete(&name).await {
                warn!("Failed to delete cache {}: {}", name, e);
                success = false;
            }
        }
        info!(success = success, "Caches cleared");
        success
    }

    /// Decide how an intercepted fetch is served
    pub async fn handle_fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let (strategy, class) = match self.rules.classify(request) {
            Route::Bypass => {
                debug!(method = %request.method, url = %request.url, "Not intercepted");
                return FetchOutcome::Passthrough;
            }
            Route::Cached { strategy, class } => (strategy, class),
        };

        let generation = self.generation(class);
        match strategy
            .execute(
                request,
                &generation,
                self.network.as_ref(),
                self.clock.as_ref(),
            )
            .await
        {
            Ok(response) => FetchOutcome::Respond(response),
            Err(e) => {
                error!(url = %request.url, strategy = strategy.name(), "Fetch error: {}", e);
                FetchOutcome::Respond(self.offline_fallback(request).await)
            }
        }
    }

    /// Cached root document for shell paths, else a synthesized 503
    async fn offline_fallback(&self, request: &FetchRequest) -> FetchResponse {
        let path = request.path();
        if path != "/" && !self.rules.is_static_path(path) {
            return FetchResponse::service_unavailable("Network error");
        }

        let root = match self.config.origin.join("/") {
            Ok(root) => root,
            Err(_) => return FetchResponse::service_unavailable("Offline"),
        };
        self.generation(GenerationClass::Static)
            .lookup(root.as_str())
            .await
            .unwrap_or_else(|| FetchResponse::service_unavailable("Offline"))
    }

    /// Handle a page message; unrecognized payloads are dropped silently
    pub async fn handle_message(&self, envelope: Envelope, scope: &dyn ClientScope) {
        let Some(message) = ClientMessage::parse(&envelope.data) else {
            debug!(payload = %envelope.data, "Ignoring unrecognized message");
            return;
        };

        match message {
            ClientMessage::SkipWaiting => {
                self.request_skip_waiting();
                scope.skip_waiting().await;
            }
            ClientMessage::GetVersion => {
                if let Some(reply) = envelope.reply {
                    reply.post(&VersionReply {
                        version: self.version().to_string(),
                    });
                }
            }
            ClientMessage::ClearCache => {
                let success = self.clear_caches().await;
                if let Some(reply) = envelope.reply {
                    reply.post(&ClearCacheReply { success });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::clock::ManualClock;
    use crate::network::MemoryNetwork;
    use crate::protocol::ReplyPort;
    use hyper::StatusCode;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Scope that records what the controller asked for
    #[derive(Default)]
    struct RecordingScope {
        skips: AtomicUsize,
        claims: AtomicUsize,
        broadcasts: std::sync::Mutex<Vec<ControllerMessage>>,
    }

    #[async_trait]
    impl ClientScope for RecordingScope {
        async fn skip_waiting(&self) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }

        async fn claim(&self) -> usize {
            self.claims.fetch_add(1, Ordering::SeqCst);
            2
        }

        async fn broadcast(&self, message: ControllerMessage) -> usize {
            self.broadcasts.lock().unwrap().push(message);
            2
        }
    }

    fn controller(network: Arc<MemoryNetwork>) -> CacheController {
        let config = ControllerConfig {
            origin: url::Url::parse("https://quiz.example").unwrap(),
            manifest: vec!["/".into(), "/quiz".into()],
            skip_waiting_on_install: false,
            ..ControllerConfig::default()
        };
        CacheController::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            network,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_install_tolerates_failed_assets() {
        let network = Arc::new(MemoryNetwork::new());
        network.serve("https://quiz.example/", FetchResponse::ok("text/html", "home"));
        // "/quiz" answers 404
        let controller = controller(network);

        let report = controller.install().await;
        assert_eq!(report.cached, vec!["/"]);
        assert_eq!(report.failed, vec!["/quiz"]);
        assert!(!report.skip_waiting);
    }

    #[tokio::test]
    async fn test_transitions_are_validated() {
        let controller = controller(Arc::new(MemoryNetwork::new()));
        assert_eq!(controller.state(), LifecycleState::Parsed);
        assert!(controller.transition(LifecycleState::Activated).is_err());
        controller.transition(LifecycleState::Installing).unwrap();
        controller.transition(LifecycleState::Installed).unwrap();
        assert!(controller.state().is_waiting());
    }

    #[tokio::test]
    async fn test_activate_broadcasts_version() {
        let controller = controller(Arc::new(MemoryNetwork::new()));
        let scope = RecordingScope::default();

        let report = controller.activate(&scope).await;

        assert_eq!(report.claimed, 2);
        assert_eq!(report.notified, 2);
        assert_eq!(scope.claims.load(Ordering::SeqCst), 1);
        assert_eq!(
            scope.broadcasts.lock().unwrap().as_slice(),
            &[ControllerMessage::Updated {
                version: "2.0.0".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_messages() {
        let controller = controller(Arc::new(MemoryNetwork::new()));
        let scope = RecordingScope::default();

        let (port, rx) = ReplyPort::channel();
        controller
            .handle_message(Envelope::with_reply(json!({"type": "GET_VERSION"}), port), &scope)
            .await;
        assert_eq!(rx.await.unwrap(), json!({"version": "2.0.0"}));

        controller
            .handle_message(Envelope::new(json!({"type": "SKIP_WAITING"})), &scope)
            .await;
        assert!(controller.skip_waiting_requested());
        assert_eq!(scope.skips.load(Ordering::SeqCst), 1);

        // Unknown types are ignored and the reply port is simply dropped
        let (port, rx) = ReplyPort::channel();
        controller
            .handle_message(Envelope::with_reply(json!({"type": "NOPE"}), port), &scope)
            .await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_for_unknown_path_is_503() {
        let network = Arc::new(MemoryNetwork::new());
        network.set_offline(true);
        let controller = controller(network);

        let request = FetchRequest::get("https://quiz.example/leaderboard").unwrap();
        match controller.handle_fetch(&request).await {
            FetchOutcome::Respond(response) => {
                assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(response.body, "Network error");
            }
            FetchOutcome::Passthrough => panic!("expected a response"),
        }
    }
}
