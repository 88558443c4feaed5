use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::routing::{MethodFilter, get, on};
use futures_util::FutureExt;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

mod classify;
mod relay;
mod retry;
mod rewrite;
mod stream;
mod target;
mod tool_args;
mod upstream;


use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::{log_upstream_error, rate_limit_headers};

use self::relay::relay_buffered_body;
use self::retry::{RetryPolicy, send_with_retry};
use self::rewrite::{RouteKind, rewrite_request_body};
use self::stream::relay_sse;
use self::target::map_target;
use self::upstream::UpstreamResponse;

const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all("connection").iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

/// `content-length` is kept: the rewriter replaces it whenever the body changes.
/// `accept-encoding` is dropped so the upstream answers with identity bodies
/// the relays can inspect.
fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if name_lower == "host"
            || name_lower == "accept-encoding"
            || is_hop_by_hop_header(&name_lower)
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        // The relayed body may be rewritten; hyper frames it again.
        if is_hop_by_hop_header(&name_lower) || name_lower == "content-length" {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn strip_mount_prefix<'a>(prefix: &str, path: &'a str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

/// Shared per-process state: the pooled client and the immutable config.
#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub config: Arc<ProxyConfig>,
    policy: RetryPolicy,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<ProxyConfig>) -> Self {
        let policy = RetryPolicy::from(&config.retry);
        Self {
            client,
            config,
            policy,
        }
    }
}

pub async fn handle_proxy(
    proxy: ProxyService,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let request_id = Uuid::new_v4();
    let span = info_span!(
        "request",
        id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    match AssertUnwindSafe(forward(proxy, req))
        .catch_unwind()
        .instrument(span.clone())
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            span.in_scope(|| error!(panic = %msg, "proxy handler panicked"));
            Err(ProxyError::Internal(msg))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn forward(proxy: ProxyService, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let started = Instant::now();
    let timeout = proxy.config.request_timeout();
    let deadline = started + timeout;

    let (parts, body) = req.into_parts();
    let path = strip_mount_prefix(&proxy.config.mount_prefix, parts.uri.path()).to_string();
    let route = RouteKind::from_path(&path);
    let target = map_target(proxy.config.upstream_base(), &path, parts.uri.query());
    info!(upstream_url = %target, route = ?route, "proxying request");

    let raw_body = to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    let mut headers = filter_request_headers(&parts.headers);
    let upstream_body = rewrite_request_body(route, &mut headers, raw_body);

    let method = parts.method;
    let send = || {
        let request = proxy
            .client
            .request(method.clone(), &target)
            .headers(headers.clone())
            .body(upstream_body.clone());
        async move {
            let resp = request.send().await?;
            Ok::<_, ProxyError>(UpstreamResponse::from(resp))
        }
    };

    let outcome = match timeout_at(deadline, send_with_retry(&proxy.policy, send)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "request timed out during retries");
            return Err(ProxyError::Timeout(timeout));
        }
    };
    let attempts = outcome.report.attempts;
    if !outcome.report.waits.is_empty() {
        info!(
            attempts,
            exhausted = outcome.report.exhausted,
            waits = %outcome.report.summary(),
            "request needed retries"
        );
    }
    let resp = outcome.result?;

    let status = resp.status();
    let upstream_headers = resp.headers().clone();
    let resp_headers = filter_response_headers(&upstream_headers);

    // Once streaming starts nothing is retried; the client sees what arrives.
    if resp.is_event_stream() {
        if status.as_u16() >= 400 {
            warn!(
                status = status.as_u16(),
                rate_limit_headers = ?rate_limit_headers(&upstream_headers),
                "upstream returned an error event stream"
            );
        }
        info!(
            status = status.as_u16(),
            attempts,
            streaming = true,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream responded"
        );
        let (_, _, body) = resp.into_parts();
        return Ok(build_response(
            status,
            resp_headers,
            Body::from_stream(relay_sse(body, timeout)),
        ));
    }

    let body = match timeout_at(deadline, resp.bytes()).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            warn!(error = %e, "failed to read upstream body");
            return Err(ProxyError::Transport(e));
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "request timed out reading upstream body");
            return Err(ProxyError::Timeout(timeout));
        }
    };

    if status.as_u16() >= 400 {
        log_upstream_error(
            method.as_str(),
            &target,
            status.as_u16(),
            &upstream_headers,
            &body,
            &upstream_body,
        );
    }
    let body = relay_buffered_body(route, status, body);
    info!(
        status = status.as_u16(),
        attempts,
        streaming = false,
        bytes = body.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "upstream responded"
    );
    Ok(build_response(status, resp_headers, Body::from(body)))
}

async fn health(proxy: ProxyService) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "target": proxy.config.upstream_base(),
    }))
}

pub fn router(proxy: ProxyService) -> Router {
    // In axum 0.8, wildcard segments use `/{*path}`.
    let methods = MethodFilter::GET
        .or(MethodFilter::POST)
        .or(MethodFilter::PUT)
        .or(MethodFilter::DELETE)
        .or(MethodFilter::PATCH)
        .or(MethodFilter::OPTIONS)
        .or(MethodFilter::HEAD);
    let catch_all = format!("{}/{{*path}}", proxy.config.mount_prefix);

    let p0 = proxy.clone();
    let p1 = proxy;

    Router::new()
        .route("/health", get(move || health(p0.clone())))
        .route(
            &catch_all,
            on(methods, move |req: Request<Body>| handle_proxy(p1.clone(), req)),
        )
}
