//! Worker host
//!
//! In-process stand-in for the browser side of controller registration.
//! The host keeps:
//! - the deployed controller config (the "script" a new version comes from)
//! - the registration slots: installing, waiting and active controllers
//! - the connected pages, each with its own controller pointer and event queue
//!
//! Install and activate jobs are serialized through an async mutex; fetches
//! and messages run concurrently with them.

pub mod client;

pub use client::{ClientConnection, ClientId, PageEvent, WorkerHandle};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::controller::{CacheController, ClientScope, LifecycleState};
use crate::network::Network;
use crate::protocol::ControllerMessage;
use crate::types::{OfflineError, Result};

#[derive(Default)]
struct Registration {
    installing: Option<Arc<CacheController>>,
    waiting: Option<Arc<CacheController>>,
    active: Option<Arc<CacheController>>,
}

struct ClientSlot {
    controller: watch::Sender<Option<Arc<CacheController>>>,
    events: mpsc::UnboundedSender<PageEvent>,
}

impl ClientSlot {
    fn is_controlled_by(&self, controller: &Arc<CacheController>) -> bool {
        self.controller
            .borrow()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, controller))
    }
}

struct HostInner {
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    deployed: Mutex<Option<ControllerConfig>>,
    registration: Mutex<Registration>,
    clients: DashMap<ClientId, ClientSlot>,
    jobs: tokio::sync::Mutex<()>,
}

/// Shared host handle; clones refer to the same host
#[derive(Clone)]
pub struct WorkerHost {
    inner: Arc<HostInner>,
}

impl WorkerHost {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                storage,
                network,
                clock,
                deployed: Mutex::new(None),
                registration: Mutex::new(Registration::default()),
                clients: DashMap::new(),
                jobs: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.inner.network
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.inner.storage
    }

    /// Publish a controller config; picked up by the next update check
    pub fn deploy(&self, config: ControllerConfig) {
        info!(version = %config.version, "Controller deployed");
        if let Ok(mut deployed) = self.inner.deployed.lock() {
            *deployed = Some(config);
        }
    }

    pub fn deployed_version(&self) -> Option<String> {
        self.deployed().map(|c| c.version)
    }

    fn deployed(&self) -> Option<ControllerConfig> {
        self.inner.deployed.lock().ok().and_then(|d| d.clone())
    }

    /// Open a page; it starts under the active controller, if any
    pub fn connect(&self) -> ClientConnection {
        let id = ClientId::new();
        let (controller_tx, controller_rx) = watch::channel(self.active_controller());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.clients.insert(
            id,
            ClientSlot {
                controller: controller_tx,
                events: events_tx,
            },
        );
        debug!(client = %id, "Page connected");
        ClientConnection::new(id, self.clone(), controller_rx, events_rx)
    }

    pub(crate) fn disconnect(&self, id: ClientId) {
        self.inner.clients.remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    fn with_registration<T>(&self, f: impl FnOnce(&mut Registration) -> T) -> Result<T> {
        let mut registration = self
            .inner
            .registration
            .lock()
            .map_err(|_| OfflineError::Internal("registration lock poisoned".into()))?;
        Ok(f(&mut registration))
    }

    fn active_controller(&self) -> Option<Arc<CacheController>> {
        self.with_registration(|r| r.active.clone()).ok().flatten()
    }

    fn handle(&self, controller: Option<Arc<CacheController>>) -> Option<WorkerHandle> {
        controller.map(|c| WorkerHandle::new(c, self.clone()))
    }

    pub fn installing(&self) -> Option<WorkerHandle> {
        self.handle(self.with_registration(|r| r.installing.clone()).ok().flatten())
    }

    pub fn waiting(&self) -> Option<WorkerHandle> {
        self.handle(self.with_registration(|r| r.waiting.clone()).ok().flatten())
    }

    pub fn active(&self) -> Option<WorkerHandle> {
        self.handle(self.active_controller())
    }

    /// Register the deployed controller.
    ///
    /// Registering again with an unchanged deployment is a no-op.
    pub async fn register(&self) -> Result<()> {
        if self.deployed().is_none() {
            return Err(OfflineError::Config("no controller deployed".into()));
        }
        self.update().await.map(|_| ())
    }

    /// Install the deployed controller if it differs from the newest one
    /// known. Returns whether a new controller was installed.
    pub async fn update(&self) -> Result<bool> {
        let _job = self.inner.jobs.lock().await;

        let Some(config) = self.deployed() else {
            debug!("Update check skipped, nothing deployed");
            return Ok(false);
        };
        let unchanged = self.with_registration(|r| {
            r.waiting
                .as_ref()
                .or(r.active.as_ref())
                .is_some_and(|c| c.config() == &config)
        })?;
        if unchanged {
            debug!(version = %config.version, "Update check: no change");
            return Ok(false);
        }

        let controller = Arc::new(CacheController::new(
            config,
            Arc::clone(&self.inner.storage),
            Arc::clone(&self.inner.network),
            Arc::clone(&self.inner.clock),
        )?);
        self.install(controller).await?;
        Ok(true)
    }

    async fn install(&self, controller: Arc<CacheController>) -> Result<()> {
        let version = controller.version().to_string();
        controller.transition(LifecycleState::Installing)?;
        self.with_registration(|r| r.installing = Some(Arc::clone(&controller)))?;
        self.notify_all(PageEvent::UpdateFound {
            version: version.clone(),
        });
        self.notify_state(&controller);

        controller.install().await;

        if let Err(e) = controller.transition(LifecycleState::Installed) {
            self.with_registration(|r| r.installing = None)?;
            return Err(e);
        }
        let replaced = self.with_registration(|r| {
            r.installing = None;
            r.waiting.replace(Arc::clone(&controller))
        })?;
        if let Some(replaced) = replaced {
            info!(version = %replaced.version(), "Waiting controller superseded");
            let _ = replaced.transition(LifecycleState::Redundant);
        }
        self.notify_state(&controller);

        let has_active = self.active_controller().is_some();
        if !has_active || controller.skip_waiting_requested() {
            self.activate_waiting().await?;
        } else {
            info!(version = %version, "Controller installed and waiting");
        }
        Ok(())
    }

    /// Promote the waiting controller. Callers hold the job lock.
    async fn activate_waiting(&self) -> Result<()> {
        let promoted = self.with_registration(|r| {
            let next = r.waiting.take()?;
            let previous = r.active.replace(Arc::clone(&next));
            Some((next, previous))
        })?;
        let Some((next, previous)) = promoted else {
            return Ok(());
        };

        if let Some(previous) = previous {
            let _ = previous.transition(LifecycleState::Redundant);
            self.notify_state(&previous);
        }

        next.transition(LifecycleState::Activating)?;
        self.notify_state(&next);

        let scope = HostScope::new(self.clone(), Arc::clone(&next));
        next.activate(&scope).await;

        next.transition(LifecycleState::Activated)?;
        self.notify_state(&next);
        Ok(())
    }

    /// Skip the waiting phase for `controller`.
    ///
    /// A controller still installing activates once its install finishes.
    pub async fn skip_waiting(&self, controller: &Arc<CacheController>) -> Result<()> {
        controller.request_skip_waiting();
        let _job = self.inner.jobs.lock().await;
        let is_waiting = self.with_registration(|r| {
            r.waiting
                .as_ref()
                .is_some_and(|w| Arc::ptr_eq(w, controller))
        })?;
        if is_waiting {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    /// Point every connected page at `controller`
    fn claim(&self, controller: &Arc<CacheController>) -> usize {
        let mut claimed = 0;
        for slot in self.inner.clients.iter() {
            let changed = slot.controller.send_if_modified(|current| {
                if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, controller)) {
                    false
                } else {
                    *current = Some(Arc::clone(controller));
                    true
                }
            });
            if changed {
                claimed += 1;
                let _ = slot.events.send(PageEvent::ControllerChanged {
                    version: controller.version().to_string(),
                });
            }
        }
        claimed
    }

    fn broadcast(&self, controller: &Arc<CacheController>, message: ControllerMessage) -> usize {
        let mut delivered = 0;
        for slot in self.inner.clients.iter() {
            if slot.is_controlled_by(controller)
                && slot.events.send(PageEvent::Message(message.clone())).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn notify_all(&self, event: PageEvent) {
        for slot in self.inner.clients.iter() {
            let _ = slot.events.send(event.clone());
        }
    }

    fn notify_state(&self, controller: &CacheController) {
        self.notify_all(PageEvent::StateChanged {
            version: controller.version().to_string(),
            state: controller.state(),
        });
    }
}

/// What one controller may do to the host's pages
pub(crate) struct HostScope {
    host: WorkerHost,
    controller: Arc<CacheController>,
}

impl HostScope {
    pub(crate) fn new(host: WorkerHost, controller: Arc<CacheController>) -> Self {
        Self { host, controller }
    }
}

#[async_trait]
impl ClientScope for HostScope {
    async fn skip_waiting(&self) {
        if let Err(e) = self.host.skip_waiting(&self.controller).await {
            warn!(version = %self.controller.version(), "Skip waiting failed: {}", e);
        }
    }

    async fn claim(&self) -> usize {
        self.host.claim(&self.controller)
    }

    async fn broadcast(&self, message: ControllerMessage) -> usize {
        self.host.broadcast(&self.controller, message)
    }
}
