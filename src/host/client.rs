//! Pages connected to a worker host

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use super::{HostScope, WorkerHost};
use crate::controller::{CacheController, FetchOutcome, LifecycleState};
use crate::fetch::{FetchRequest, FetchResponse};
use crate::protocol::{ControllerMessage, Envelope, ReplyPort};
use crate::types::Result;

/// Identifier of one connected page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Signals the host delivers to a page
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// A new controller began installing
    UpdateFound { version: String },
    /// A controller moved to another lifecycle state
    StateChanged {
        version: String,
        state: LifecycleState,
    },
    /// The page is now governed by another controller
    ControllerChanged { version: String },
    /// Broadcast from the page's controller
    Message(ControllerMessage),
}

/// Handle to one controller, as seen from a page
#[derive(Clone)]
pub struct WorkerHandle {
    controller: Arc<CacheController>,
    host: WorkerHost,
}

impl WorkerHandle {
    pub(crate) fn new(controller: Arc<CacheController>, host: WorkerHost) -> Self {
        Self { controller, host }
    }

    pub fn version(&self) -> &str {
        self.controller.version()
    }

    pub fn state(&self) -> LifecycleState {
        self.controller.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.controller.watch_state()
    }

    pub fn controller(&self) -> &Arc<CacheController> {
        &self.controller
    }

    /// Deliver a message to the controller; handling happens in the background
    pub fn post_message(&self, data: Value, reply: Option<ReplyPort>) {
        let envelope = Envelope { data, reply };
        let scope = HostScope::new(self.host.clone(), Arc::clone(&self.controller));
        let controller = Arc::clone(&self.controller);
        tokio::spawn(async move {
            controller.handle_message(envelope, &scope).await;
        });
    }

    pub fn same_controller(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.controller, &other.controller)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

/// One page connected to the host.
///
/// Dropping the connection closes the page.
pub struct ClientConnection {
    id: ClientId,
    host: WorkerHost,
    controller: watch::Receiver<Option<Arc<CacheController>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PageEvent>>>,
}

impl ClientConnection {
    pub(crate) fn new(
        id: ClientId,
        host: WorkerHost,
        controller: watch::Receiver<Option<Arc<CacheController>>>,
        events: mpsc::UnboundedReceiver<PageEvent>,
    ) -> Self {
        Self {
            id,
            host,
            controller,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn host(&self) -> &WorkerHost {
        &self.host
    }

    /// Register the deployed controller, installing it if it is new
    pub async fn register(&self) -> Result<()> {
        self.host.register().await
    }

    /// Check for a newer deployed controller
    pub async fn update(&self) -> Result<bool> {
        self.host.update().await
    }

    /// Controller currently governing this page
    pub fn controller(&self) -> Option<WorkerHandle> {
        self.controller
            .borrow()
            .as_ref()
            .map(|c| WorkerHandle::new(Arc::clone(c), self.host.clone()))
    }

    /// Fires whenever this page changes controller
    pub fn watch_controller(&self) -> watch::Receiver<Option<Arc<CacheController>>> {
        self.controller.clone()
    }

    pub fn installing(&self) -> Option<WorkerHandle> {
        self.host.installing()
    }

    pub fn waiting(&self) -> Option<WorkerHandle> {
        self.host.waiting()
    }

    pub fn active(&self) -> Option<WorkerHandle> {
        self.host.active()
    }

    /// Take the page's event stream; only the first caller gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PageEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    /// Fetch as this page: through its controller when it has one
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let controller = self.controller.borrow().clone();
        if let Some(controller) = controller {
            match controller.handle_fetch(request).await {
                FetchOutcome::Respond(response) => return Ok(response),
                FetchOutcome::Passthrough => {}
            }
        }
        self.host.network().fetch(request).await
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        debug!(client = %self.id, "Page closed");
        self.host.disconnect(self.id);
    }
}
