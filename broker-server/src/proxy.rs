//! HTTP-to-tunnel proxy dispatch.
//!
//! `/connections/{id}/{path}` requests are resolved to a live tunnel via the
//! provider (local or mesh-forwarded, the dispatcher cannot tell) and
//! relayed over the dialed stream as an HTTP request, with the response
//! streamed back verbatim. Bodies are never buffered whole: hyper drives
//! both directions over the stream concurrently. No state survives a call.

use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header::HeaderName, HeaderValue, Request, Response, StatusCode},
};
use broker_core::{BrokerError, TunnelId};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tracing::{debug, error};

/// Agent-side address a dialed stream should terminate at. Agents map this
/// to their configured local service.
const AGENT_SERVICE_ADDR: &str = "127.0.0.1:80";

/// `ANY /connections/:id/*path`
pub async fn dispatch(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    request: Request<Body>,
) -> Response<Body> {
    match relay(state, id, path, request).await {
        Ok(response) => response,
        Err(e) => {
            error!("Proxy dispatch failed: {}", e);
            error_response(e)
        }
    }
}

/// `ANY /connections/:id` - same dispatch with an empty remaining path.
pub async fn dispatch_root(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    match relay(state, id, String::new(), request).await {
        Ok(response) => response,
        Err(e) => {
            error!("Proxy dispatch failed: {}", e);
            error_response(e)
        }
    }
}

async fn relay(
    state: AppState,
    id: String,
    path: String,
    request: Request<Body>,
) -> Result<Response<Body>, BrokerError> {
    let tunnel_id = TunnelId::new(id);
    debug!("Dispatching {} {} via tunnel '{}'", request.method(), path, tunnel_id);

    // The provider bounds each open attempt; this bounds the whole
    // resolution including mesh fallbacks.
    let stream = tokio::time::timeout(
        state.dial_timeout,
        state.provider.dial(&tunnel_id, "tcp", AGENT_SERVICE_ADDR),
    )
    .await
    .map_err(|_| BrokerError::Timeout(state.dial_timeout))??;

    let (parts, body) = request.into_parts();

    let mut uri = format!("/{}", path);
    if let Some(query) = parts.uri.query() {
        uri.push('?');
        uri.push_str(query);
    }

    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    if !parts.headers.contains_key(http::header::HOST) {
        builder = builder.header(
            http::header::HOST,
            HeaderValue::from_str(tunnel_id.as_str())
                .unwrap_or_else(|_| HeaderValue::from_static("tunnel")),
        );
    }
    let outbound = builder
        .body(body)
        .map_err(|e| BrokerError::Relay(e.to_string()))?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| BrokerError::Relay(e.to_string()))?;

    // The connection task shuttles both directions; dropping it mid-stream
    // aborts the in-flight response, which is the intended failure mode.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Tunnel relay connection ended: {}", e);
        }
    });

    let response = tokio::time::timeout(state.dial_timeout, sender.send_request(outbound))
        .await
        .map_err(|_| BrokerError::Timeout(state.dial_timeout))?
        .map_err(|e| BrokerError::Relay(e.to_string()))?;

    let (mut parts, incoming) = response.into_parts();
    let hop_headers: Vec<HeaderName> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in hop_headers {
        parts.headers.remove(&name);
    }

    Ok(Response::from_parts(parts, Body::new(incoming)))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn error_response(err: BrokerError) -> Response<Body> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(err.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("internal error"))
                .unwrap()
        })
}
