//! Small tracing helpers: a per-connection request id and a colorized
//! access-log line, built on top of `tower_http::trace::TraceLayer`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode, Uri, Version};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::Extension;

#[derive(Clone)]
pub struct RequestId(Arc<AtomicU64>);

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> RequestId {
        RequestId(Arc::new(0.into()))
    }

    pub fn next(&mut self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Request-scoped fields stashed in the response extensions by
/// [`tracing_middleware`] so `TraceLayer`'s `on_response` hook can log an
/// access-log line without re-deriving them from the request itself.
#[derive(Clone)]
pub struct TracingInfo {
    pub connect_info: ConnectInfo<SocketAddr>,
    pub method: Method,
    pub version: Version,
    pub uri: Uri,
}

/// Colorizes a status code for terminal output without pulling in a
/// dedicated styling dependency: 2xx green, 3xx blue, 4xx red, else yellow.
pub struct ColoredStatus(pub StatusCode);

impl fmt::Display for ColoredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0.as_u16() {
            200..=299 => "32",
            300..=399 => "34",
            400..=499 => "31",
            _ => "33",
        };
        write!(f, "\x1b[{color}m{}\x1b[0m", self.0)
    }
}

/// Dims a string the way the reference binary renders byte counts and other
/// secondary detail in its access log.
pub fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

pub async fn tracing_middleware(request: Request<Body>, next: Next) -> impl IntoResponse {
    let connect_info = *request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .expect("ConnectInfo extension set by into_make_service_with_connect_info");

    let method = request.method().clone();
    let version = request.version();
    let uri = request.uri().clone();

    let tracing_info = TracingInfo {
        connect_info,
        method,
        version,
        uri,
    };

    let response = next.run(request).await;

    (Extension(tracing_info), response)
}
