//! HTTP surface of the offline proxy

pub mod http;

pub use http::{route, run, AppState, ProxyPage, ADMIN_PREFIX};
