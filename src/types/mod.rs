//! Shared types

pub mod error;

pub use error::{OfflineError, Result};
