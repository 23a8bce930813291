//! Crate-wide error type. One variant per distinct failure mode; each
//! carries whatever data its HTTP mapping needs.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::pktline::PktLineError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request parser could not make sense of the client's request body.
    #[error("wrong upload pack input: {0}")]
    ParseError(String),

    /// `git` stderr contained `HTTP Basic: Access denied`.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Upstream was unreachable after exhausting retries.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream responded with a non-retryable >=400 status.
    #[error("upstream error {status}: {body}")]
    UpstreamError {
        status: StatusCode,
        body: String,
    },

    /// Clone/fetch exhausted its retry budget.
    #[error("mirror update failed: {0}")]
    MirrorUpdateFailed(String),

    /// The child `git upload-pack`/`git cat-file`/etc. process could not be spawned or reaped.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    PktLine(#[from] PktLineError),

    /// The background lock-holding thread for a path is gone.
    #[error("lock worker for {0} is no longer running")]
    LockWorkerGone(String),

    /// A request was cancelled by the client mid-flight. Not surfaced to the
    /// client (there's nobody left to surface it to); logged and leases released.
    #[error("client disconnected")]
    Canceled,
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::ParseError(_) => StatusCode::OK,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamError { status, .. } => *status,
            Error::MirrorUpdateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) | Error::PktLine(_) | Error::LockWorkerGone(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Canceled => StatusCode::OK,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");

        let status = self.status();
        let mut response = match &self {
            Error::MirrorUpdateFailed(stderr) => (status, stderr.clone()).into_response(),
            Error::UpstreamError { body, .. } => (status, body.clone()).into_response(),
            _ => (status, self.to_string()).into_response(),
        };

        if let Error::Unauthorized(_) = self {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static(r#"Basic realm="Git Proxy""#),
            );
        }

        response
    }
}
