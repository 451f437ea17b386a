//! Request and response values flowing through the controller
//!
//! These are owned, cloneable snapshots: a response read from the network can
//! be stored in a cache generation and returned to the page at the same time.

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::types::Result;

/// A request issued by a page
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Parse `url` into a GET request
    pub fn get(url: &str) -> Result<Self> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// URL path component (`/quiz`, `/`)
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    /// Key under which this request's response is cached.
    ///
    /// Fragments never reach the server, so they are not part of the key.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

/// A response, either live from the network or read back from a generation
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 200 response with a content type
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body).with_header(CONTENT_TYPE, content_type)
    }

    /// Synthesized 503 used when neither network nor cache can answer
    pub fn service_unavailable(message: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message.to_string())
            .with_header(CONTENT_TYPE, "text/plain")
    }

    /// Set a header; values that are not valid header text are dropped
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the status is 2xx
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_drops_fragment() {
        let request = FetchRequest::get("https://quiz.example/results?day=3#share").unwrap();
        assert_eq!(request.cache_key(), "https://quiz.example/results?day=3");
        assert_eq!(request.path(), "/results");
        assert!(request.is_get());
    }

    #[test]
    fn test_invalid_url() {
        assert!(FetchRequest::get("not a url").is_err());
    }

    #[test]
    fn test_service_unavailable() {
        let response = FetchResponse::service_unavailable("Offline");
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.is_ok());
        assert_eq!(response.body, Bytes::from("Offline"));
        assert_eq!(response.header("content-type"), Some("text/plain"));
    }
}
