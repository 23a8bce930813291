//! Shared test fixtures: build a real [`AppState`]-backed router against a
//! throwaway working directory and drive it with `tower::ServiceExt`, the
//! way the reference binary's own HTTP-layer tests do.

use std::path::Path;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt as _;
use tower::ServiceExt as _;

use crate::config::Config;
use crate::http::{self, AppState};

/// A router backed by a fresh temp working directory. Most tests never
/// reach `upstream` at all (parse errors and path rejection are answered
/// locally); the ones that do expect it to be unreachable.
pub fn router(workdir: &Path, upstream: &str) -> Router {
    let config =
        Config::from_env(workdir.to_path_buf(), upstream.to_string()).expect("valid test config");
    http::router(AppState::new(Arc::new(config)))
}

pub async fn get(app: &Router, path: impl ToString) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(path.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn post(
    app: &Router,
    path: impl ToString,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> Response {
    let mut builder = Request::builder().method("POST").uri(path.to_string());
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    app.clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("reading full response body")
        .to_bytes()
}
