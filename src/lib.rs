//! maestro-offline - offline support for the Maestro music quiz
//!
//! Keeps the quiz usable without a network and rolls out new versions
//! without breaking pages that are already open.
//!
//! ## Components
//!
//! - **Controller**: owns the versioned cache generations, pre-warms the app
//!   shell, serves every intercepted fetch with a per-route caching strategy
//! - **Host**: in-process registration of controllers and connected pages
//!   (install, waiting, activation, claiming)
//! - **Coordinator**: per-page update detection, notification and the
//!   user-driven apply-update flow
//! - **Server**: HTTP proxy that runs one long-lived page against a real origin

pub mod cache;
pub mod clock;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod fetch;
pub mod host;
pub mod network;
pub mod protocol;
pub mod server;
pub mod types;

pub use config::{Args, ControllerConfig};
pub use controller::{CacheController, ClientScope, FetchOutcome, LifecycleState};
pub use coordinator::{CoordinatorConfig, Page, UpdateCoordinator, UpdateNotice};
pub use fetch::{FetchRequest, FetchResponse};
pub use host::{ClientConnection, PageEvent, WorkerHandle, WorkerHost};
pub use server::{run, AppState};
pub use types::{OfflineError, Result};
