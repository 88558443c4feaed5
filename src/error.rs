//! Errors surfaced by the proxy handler.
//!
//! Upstream 4xx/5xx responses are not errors here: they are relayed to the
//! client verbatim. Rewrite failures never reach this type either; they are
//! logged and the original bytes are forwarded.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// DNS/connect/reset failures that persisted through every retry.
    #[error("Proxy request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The outer request deadline expired during retries or the body read.
    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// The inbound body could not be read.
    #[error("Invalid request body: {0}")]
    BadRequest(String),

    #[error("Internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let mut resp = Response::new(Body::from(self.to_string()));
        *resp.status_mut() = status;
        resp
    }
}
