#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![recursion_limit = "256"]

pub mod config;
pub mod error;
pub mod http;
pub mod lock;
pub mod pack_cache;
pub mod parser;
pub mod pktline;
pub mod repo;
pub mod semaphore;
pub mod supervisor;
#[cfg(test)]
mod test;
mod tracing_extra;
pub mod upload_pack;

use std::net::SocketAddr;
use std::process::Command;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::http::{header, Request};
use axum::middleware;
use axum::response::Response;
use tower_http::trace::TraceLayer;
use tracing::Span;

use tracing_extra::{tracing_middleware, ColoredStatus, RequestId, TracingInfo};

pub use config::Config;

/// Everything `main` needs to start the server: where to listen, and the
/// configuration built from the environment.
pub struct Options {
    pub listen: SocketAddr,
    pub config: Config,
}

/// Run the proxy until it errors out or the process is killed.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let git_version = Command::new("git")
        .arg("version")
        .output()
        .context("'git' command must be available")?
        .stdout;
    tracing::info!("{}", str::from_utf8(&git_version)?.trim());

    let listen = options.listen;
    tracing::info!(
        workdir = %options.config.working_directory.display(),
        upstream = %options.config.upstream,
        "listening on http://{}", listen
    );

    let config = Arc::new(options.config);
    let state = http::AppState::new(config);
    let request_id = RequestId::new();

    let app = http::router(state)
        .layer(middleware::from_fn(tracing_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |_request: &Request<axum::body::Body>| {
                    tracing::info_span!("request", id = %request_id.clone().next())
                })
                .on_response(
                    |response: &Response, latency: Duration, _span: &Span| {
                        if let Some(info) = response.extensions().get::<TracingInfo>() {
                            let size = response
                                .headers()
                                .get(header::CONTENT_LENGTH)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("0");
                            tracing::info!(
                                "{} \"{} {} {:?}\" {} {:?} {}",
                                info.connect_info.0,
                                info.method,
                                info.uri,
                                info.version,
                                ColoredStatus(response.status()),
                                latency,
                                tracing_extra::dim(size),
                            );
                        } else {
                            tracing::info!("processed");
                        }
                    },
                ),
        )
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .await
        .map_err(anyhow::Error::from)
}

pub mod logger {
    use tracing::dispatcher::Dispatch;

    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(Dispatch::new(subscriber()))
    }

    #[cfg(feature = "logfmt")]
    pub fn subscriber() -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt as _;
        use tracing_subscriber::EnvFilter;

        tracing_subscriber::Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_logfmt::layer())
    }

    #[cfg(not(feature = "logfmt"))]
    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }
}
