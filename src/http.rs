//! HTTP surface: the axum router tying the wire-protocol codec, request
//! parser, caches, and supervisor together. The load-bearing glue the
//! core handlers are invoked through.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use tokio_util::io::ReaderStream;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Error;
use crate::lock::LockManager;
use crate::parser::{Command, Request as UploadRequest};
use crate::semaphore::UploadPackSemaphore;
use crate::upload_pack::{RealUploadPackSpawner, UploadPackHandler};

const STREAM_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    upload_pack: Arc<UploadPackHandler>,
    client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let locks = Arc::new(LockManager::new());
        let semaphore = Some(UploadPackSemaphore::new(config.max_git_upload_pack));
        let upload_pack = Arc::new(UploadPackHandler::new(
            config.clone(),
            locks,
            semaphore,
            Arc::new(RealUploadPackSpawner),
        ));
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.git_ssl_no_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("building the upstream reqwest client");
        AppState {
            config,
            upload_pack,
            client,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/*path", get(handle_get).post(handle_post))
        .layer(RequestDecompressionLayer::new().gzip(true))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(concat!("git-cdn-rs/", env!("CARGO_PKG_VERSION"))),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

async fn handle_get(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Response {
    match dispatch_get(&state, &path, &query, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch_get(
    state: &AppState,
    path: &str,
    query: &InfoRefsQuery,
    headers: &HeaderMap,
) -> Result<Response, Error> {
    check_path(path)?;

    if let Some(repo_path) = path.strip_suffix("/info/refs") {
        if query.service.as_deref() == Some("git-upload-pack") {
            return forward_info_refs(state, repo_path, headers).await;
        }
    }

    Ok(passthrough_stub())
}

async fn handle_post(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch_post(&state, &path, &headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch_post(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    check_path(path)?;

    let Some(repo_path) = path.strip_suffix("/git-upload-pack") else {
        return Ok(passthrough_stub());
    };

    let protocol_version = protocol_version_from_headers(headers);
    let request = UploadRequest::parse(&body, protocol_version);

    // v2 commands other than `fetch` (ls-refs, object-info, ...) are not
    // handled locally; forward the raw body upstream unchanged.
    if protocol_version == 2 && !matches!(request.command, Command::Fetch) {
        return Ok(passthrough_stub());
    }

    // A malformed request is answered locally with a single `ERR` pkt-line
    // and never reaches upstream at all, so there's nothing to probe or
    // authenticate against yet.
    let creds = if request.parse_error {
        String::new()
    } else {
        let auth_header = headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| Error::Unauthorized("missing Authorization header".to_string()))?
            .to_str()
            .map_err(|_| Error::Unauthorized("non-ASCII Authorization header".to_string()))?
            .to_string();

        // Re-check credentials and repo existence against upstream before
        // doing any local work; a non-200 here is forwarded to the client
        // verbatim.
        probe_info_refs(state, repo_path, &auth_header).await?;
        url_creds_from_auth(&auth_header)?
    };

    let repo_path = repo_path.to_string();
    let handler = state.upload_pack.clone();

    let (writer, reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
    tokio::spawn(async move {
        let mut writer = writer;
        if let Err(e) = handler
            .run(&repo_path, &creds, protocol_version, &request, &mut writer)
            .await
        {
            tracing::warn!(error = %e, repo_path, "upload-pack request ended in error");
        }
    });

    let stream = ReaderStream::new(reader);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-result",
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("building the upload-pack response"))
}

async fn forward_info_refs(
    state: &AppState,
    repo_path: &str,
    headers: &HeaderMap,
) -> Result<Response, Error> {
    let url = format!(
        "{}/{}/info/refs?service=git-upload-pack",
        state.config.upstream.trim_end_matches('/'),
        repo_path.trim_matches('/'),
    );
    let mut req = state.client.get(&url);
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        req = req.header(header::AUTHORIZATION, auth.clone());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
    let status = resp.status();
    let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;

    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    Ok(builder
        .body(Body::from(body))
        .expect("building the info/refs response"))
}

/// Probe upstream's own `info/refs` endpoint with the client's credentials:
/// this re-checks auth and repo existence statelessly before any local work
/// is done, and catches a non-200 upstream response before the client has
/// been promised a streaming 200.
async fn probe_info_refs(state: &AppState, repo_path: &str, auth: &str) -> Result<(), Error> {
    let url = format!(
        "{}/{}/info/refs?service=git-upload-pack",
        state.config.upstream.trim_end_matches('/'),
        repo_path.trim_matches('/'),
    );
    let resp = state
        .client
        .get(&url)
        .header(header::AUTHORIZATION, auth)
        .send()
        .await
        .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::UpstreamError { status, body });
    }
    Ok(())
}

fn protocol_version_from_headers(headers: &HeaderMap) -> u32 {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("version="))
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Decode an `Authorization: Basic <base64>` header into `user:pass`
/// URL-safe userinfo, the way the upstream clone URL embeds it.
fn url_creds_from_auth(auth: &str) -> Result<String, Error> {
    let encoded = auth.split_once(' ').map(|(_, b)| b).unwrap_or(auth);
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Unauthorized(format!("malformed Authorization header: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::Unauthorized("non-UTF-8 Authorization header".to_string()))?;

    let (user, pass) = decoded.split_once(':').unwrap_or((&decoded, ""));
    let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    Ok(format!("{}:{}", encode(user), encode(pass)))
}

/// Rejects absolute paths and `..` traversal, matching the guard the
/// reference router applies before deriving a repo path from the URL.
fn check_path(path: &str) -> Result<(), Error> {
    if path.starts_with('/') || path.starts_with("../") || path.contains("/../") {
        return Err(Error::ParseError(format!("bad path: {path}")));
    }
    Ok(())
}

/// Any recognised repo path verb other than `info/refs`/`git-upload-pack`
/// (pushes, LFS, clone bundles, ...) is stubbed so the route exists and is
/// reachable, without implementing the outer dispatcher.
fn passthrough_stub() -> Response {
    (StatusCode::NOT_IMPLEMENTED, "not handled by this proxy core").into_response()
}
