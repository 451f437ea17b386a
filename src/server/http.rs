//! Offline proxy HTTP server
//!
//! Uses hyper http1 with TokioIo, one task per connection. Every request not
//! under `/__offline` is a fetch by the proxy page and goes through its
//! controller.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::coordinator::{Page, UpdateCoordinator};
use crate::fetch::{FetchRequest, FetchResponse};
use crate::host::WorkerHost;
use crate::protocol::{ClientMessage, ReplyPort};
use crate::types::{OfflineError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Prefix of the admin surface
pub const ADMIN_PREFIX: &str = "/__offline";

/// Headers that describe one connection rather than the resource
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

/// Shared application state
pub struct AppState {
    pub listen: SocketAddr,
    /// Origin page fetches are resolved against
    pub origin: Url,
    pub host: WorkerHost,
    /// Coordinator of the one long-lived proxy page
    pub coordinator: Arc<UpdateCoordinator>,
    /// How long admin message calls wait for a controller reply
    pub reply_timeout: Duration,
}

/// The proxy's page; a reload only resets its update notice
#[derive(Debug, Default)]
pub struct ProxyPage {
    reloads: AtomicUsize,
}

impl ProxyPage {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl Page for ProxyPage {
    fn reload(&self) {
        let count = self.reloads.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reloads = count, "Proxy page reloaded under new controller");
    }
}

/// Run the proxy until the listener fails
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.listen).await?;

    info!(
        "Offline proxy listening on {} for origin {}",
        state.listen, state.origin
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    debug!("[{}] {} {}", addr, parts.method, parts.uri);

    let response = route(&state, parts.method, &parts.uri, parts.headers, body).await;
    Ok(to_boxed(response))
}

/// Dispatch one request to the admin surface or the proxy page
pub async fn route(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let path = uri.path();
    if path == ADMIN_PREFIX || path.starts_with(&format!("{}/", ADMIN_PREFIX)) {
        return match (method, &path[ADMIN_PREFIX.len()..]) {
            (Method::GET, "/health") => health(state),
            (Method::POST, "/message") => post_message(state, &body).await,
            (Method::GET, "/update") => match serde_json::to_value(state.coordinator.notice()) {
                Ok(notice) => json_response(StatusCode::OK, &notice),
                Err(e) => {
                    let (status, message) = OfflineError::from(e).into_status_code_and_body();
                    error_response(status, &message)
                }
            },
            (Method::POST, "/update") => {
                let installed = state.coordinator.install_update().await;
                json_response(StatusCode::OK, &json!({ "installed": installed }))
            }
            _ => error_response(StatusCode::NOT_FOUND, &format!("No admin route {}", path)),
        };
    }

    match page_fetch(state, method, uri, headers, body).await {
        Ok(response) => into_response(response),
        Err(e) => {
            warn!("Origin fetch failed for {}: {}", uri, e);
            let (status, message) = e.into_status_code_and_body();
            error_response(status, &message)
        }
    }
}

fn health(state: &AppState) -> Response<Full<Bytes>> {
    let version = state.host.active().map(|c| c.version().to_string());
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "version": version,
        }),
    )
}

async fn post_message(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let data: Value = match serde_json::from_slice(body) {
        Ok(data) => data,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e)),
    };
    let Some(message) = ClientMessage::parse(&data) else {
        return error_response(StatusCode::BAD_REQUEST, "Unknown message type");
    };

    let controller = state
        .coordinator
        .connection()
        .and_then(|c| c.controller())
        .or_else(|| state.host.active());
    let Some(controller) = controller else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No active controller");
    };

    match message {
        ClientMessage::SkipWaiting => {
            // Addressed to the waiting controller when there is one
            let target = state.host.waiting().unwrap_or(controller);
            target.post_message(data, None);
            json_response(StatusCode::ACCEPTED, &json!({ "accepted": true }))
        }
        ClientMessage::GetVersion | ClientMessage::ClearCache => {
            let (port, reply) = ReplyPort::channel();
            controller.post_message(data, Some(port));
            match timeout(state.reply_timeout, reply).await {
                Ok(Ok(value)) => json_response(StatusCode::OK, &value),
                Ok(Err(_)) => {
                    let (status, message) =
                        OfflineError::ChannelClosed("controller dropped the reply port".into())
                            .into_status_code_and_body();
                    error_response(status, &message)
                }
                Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "Controller did not reply"),
            }
        }
    }
}

async fn page_fetch(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<FetchResponse> {
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = state.origin.join(target)?;
    let request = FetchRequest::new(method, url)
        .with_headers(strip_headers(headers))
        .with_body(body);

    match state.coordinator.connection() {
        Some(page) => page.fetch(&request).await,
        None => state.host.network().fetch(&request).await,
    }
}

fn strip_headers(mut headers: HeaderMap) -> HeaderMap {
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
    headers
}

fn into_response(fetched: FetchResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(fetched.body));
    *response.status_mut() = fetched.status;
    *response.headers_mut() = strip_headers(fetched.headers);
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": message,
        }),
    )
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
