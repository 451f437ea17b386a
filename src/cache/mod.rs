//! Caching layer
//!
//! Cache storage is split into versioned generations (see [`generation`]),
//! each request is routed by [`rules`] to one of the [`strategy`] functions,
//! and [`expiry`] handles the storage timestamps that bound entry lifetime.
//!
//! ## Storage backends
//!
//! - [`MemoryCacheStorage`]: process-local, used by tests and simulations
//! - [`DiskCacheStorage`]: survives restarts of the offline proxy

pub mod disk;
pub mod expiry;
pub mod generation;
pub mod rules;
pub mod storage;
pub mod strategy;

pub use disk::{DiskCache, DiskCacheStorage};
pub use expiry::{stamped, sweep_expired, Stamp, STORED_AT_HEADER};
pub use generation::{Generation, GenerationClass, GenerationNames};
pub use rules::{Route, RoutingConfig, RoutingRules};
pub use storage::{Cache, CacheStorage, MemoryCache, MemoryCacheStorage};
pub use strategy::Strategy;
