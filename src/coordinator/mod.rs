//! Update coordinator
//!
//! One coordinator per page. It registers the deployed controller, tracks
//! whether a newer version is ready, lets the UI subscribe to that, and runs
//! the user-driven "apply update" flow that ends in a page reload.
//!
//! New versions are detected two ways:
//! - a controller reaches `installed` while the page already has a controller
//! - a controller that just activated broadcasts `SW_UPDATED`
//!
//! In both cases the version comes from the controller itself.

pub mod emitter;
pub mod poller;

pub use emitter::{EventEmitter, Subscription};
pub use poller::PeriodicTask;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::controller::LifecycleState;
use crate::host::{ClientConnection, PageEvent};
use crate::protocol::{ClientMessage, ControllerMessage, ReplyPort};
use crate::types::{OfflineError, Result};

/// What the UI is told about available updates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotice {
    pub current_version: Option<String>,
    pub new_version: Option<String>,
    pub update_available: bool,
}

/// The page the coordinator lives in
pub trait Page: Send + Sync {
    /// Reload so the page runs under its new controller
    fn reload(&self);
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between background update checks
    pub update_interval: Duration,
    /// How long `install_update` waits for the controller to change
    pub install_timeout: Duration,
    /// How long a `GET_VERSION` reply may take
    pub reply_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(30 * 60),
            install_timeout: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    connection: Option<ClientConnection>,
    page: Arc<dyn Page>,
    config: CoordinatorConfig,
    notice: Mutex<UpdateNotice>,
    emitter: EventEmitter<UpdateNotice>,
}

impl Shared {
    async fn current_version(&self) -> Option<String> {
        let controller = self.connection.as_ref()?.controller()?;
        let (port, reply) = ReplyPort::channel();
        controller.post_message(ClientMessage::GetVersion.to_value(), Some(port));

        match timeout(self.config.reply_timeout, reply).await {
            Ok(Ok(value)) => value
                .get("version")
                .and_then(|v| v.as_str())
                .map(String::from),
            Ok(Err(_)) => {
                debug!("Controller dropped the version request");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.reply_timeout.as_millis() as u64,
                    "Version request timed out"
                );
                None
            }
        }
    }

    async fn check_for_update(&self) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        match connection.update().await {
            Ok(true) => info!("Update check installed a new controller"),
            Ok(false) => debug!("Update check: up to date"),
            Err(e) => warn!("Update check failed: {}", e),
        }
    }

    fn handle_event(&self, event: PageEvent) {
        match event {
            PageEvent::StateChanged {
                version,
                state: LifecycleState::Installed,
            } => {
                let controlled_by_other = self
                    .connection
                    .as_ref()
                    .and_then(|c| c.controller())
                    .is_some_and(|c| c.version() != version);
                if controlled_by_other {
                    info!(version = %version, "New version available");
                    self.announce(version);
                }
            }
            PageEvent::Message(ControllerMessage::Updated { version }) => {
                info!(version = %version, "Controller updated");
                self.announce(version);
            }
            other => debug!(event = ?other, "Page event"),
        }
    }

    /// Record `version` as available and notify listeners once per version
    fn announce(&self, version: String) {
        let notice = {
            let Ok(mut notice) = self.notice.lock() else {
                return;
            };
            if notice.current_version.as_deref() == Some(version.as_str()) {
                debug!(version = %version, "Already running this version");
                return;
            }
            if notice.update_available && notice.new_version.as_deref() == Some(version.as_str())
            {
                return;
            }
            notice.new_version = Some(version);
            notice.update_available = true;
            notice.clone()
        };
        self.emitter.emit(&notice);
    }
}

pub struct UpdateCoordinator {
    shared: Arc<Shared>,
    registered: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<PeriodicTask>>,
}

impl UpdateCoordinator {
    /// `connection` is `None` when the page cannot host controllers
    pub fn new(
        connection: Option<ClientConnection>,
        page: Arc<dyn Page>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection,
                page,
                config,
                notice: Mutex::new(UpdateNotice::default()),
                emitter: EventEmitter::new(),
            }),
            registered: AtomicBool::new(false),
            listener: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> Option<&ClientConnection> {
        self.shared.connection.as_ref()
    }

    /// Register the controller and start watching for updates.
    ///
    /// Calling it again is a no-op. Without controller support this logs a
    /// warning and returns `Ok`.
    pub async fn register(&self) -> Result<()> {
        if self.shared.config.update_interval.is_zero() {
            return Err(OfflineError::Config(
                "Update interval must be greater than zero".into(),
            ));
        }
        if self.registered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(connection) = self.shared.connection.as_ref() else {
            warn!("Offline caching not supported on this page");
            return Ok(());
        };

        if let Err(e) = connection.register().await {
            error!("Controller registration failed: {}", e);
            self.registered.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let version = self.shared.current_version().await;
        info!(version = ?version, "Controller registered");
        if let Ok(mut notice) = self.shared.notice.lock() {
            notice.current_version = version;
        }

        if let Some(events) = connection.take_events() {
            self.start_listener(events);
        }
        self.start_poller()
    }

    fn start_listener(&self, mut events: mpsc::UnboundedReceiver<PageEvent>) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.handle_event(event);
            }
            debug!("Page event stream closed");
        });
        if let Ok(mut listener) = self.listener.lock() {
            *listener = Some(handle);
        }
    }

    fn start_poller(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let task = PeriodicTask::spawn(
            "update-check",
            self.shared.config.update_interval,
            move || {
                let shared = Arc::clone(&shared);
                async move { shared.check_for_update().await }
            },
        )?;
        if let Ok(mut poller) = self.poller.lock() {
            *poller = Some(task);
        }
        Ok(())
    }

    pub fn on_update_available<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&UpdateNotice) + Send + Sync + 'static,
    {
        self.shared.emitter.subscribe(listener)
    }

    pub fn notice(&self) -> UpdateNotice {
        self.shared
            .notice
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    /// Version of the controller governing this page
    pub async fn current_version(&self) -> Option<String> {
        self.shared.current_version().await
    }

    /// Hand control to the waiting controller, then reload the page.
    ///
    /// Returns false when nothing is waiting or the controller did not change
    /// within the install timeout.
    pub async fn install_update(&self) -> bool {
        let Some(connection) = self.shared.connection.as_ref() else {
            warn!("No update available to install");
            return false;
        };
        let Some(waiting) = connection.waiting() else {
            warn!("No update available to install");
            return false;
        };

        let mut controller = connection.watch_controller();
        controller.borrow_and_update();
        waiting.post_message(ClientMessage::SkipWaiting.to_value(), None);

        match timeout(self.shared.config.install_timeout, controller.changed()).await {
            Ok(Ok(())) => {
                info!(version = %waiting.version(), "New controller took control");
                self.shared.page.reload();
                // A reloaded page starts from a fresh notice
                if let Ok(mut notice) = self.shared.notice.lock() {
                    *notice = UpdateNotice {
                        current_version: Some(waiting.version().to_string()),
                        ..UpdateNotice::default()
                    };
                }
                true
            }
            Ok(Err(_)) => {
                warn!("Page closed before the new controller took control");
                false
            }
            Err(_) => {
                warn!(
                    version = %waiting.version(),
                    timeout_ms = self.shared.config.install_timeout.as_millis() as u64,
                    "New controller did not take control in time"
                );
                false
            }
        }
    }

    /// Check for an update whenever the page becomes visible
    pub async fn on_visibility_change(&self, hidden: bool) {
        if !hidden {
            self.shared.check_for_update().await;
        }
    }

    pub async fn check_for_update(&self) {
        self.shared.check_for_update().await;
    }

    pub fn is_polling(&self) -> bool {
        self.poller.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Stop the event listener and the periodic update check
    pub fn dispose(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(task) = poller.take() {
                task.cancel();
            }
        }
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}
