use crate::auth::Authenticator;
use crate::engine::{API_KEY_HEADER, CLIENT_IP_HEADER};
use crate::metrics::{normalize_source, EngineMetrics};
use crate::request::{InBandVerdict, ParsedRequest};
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Shared state for the ingress handler tasks.
#[derive(Clone)]
pub struct IngressState {
    pub engine: String,
    pub auth: Arc<Authenticator>,
    pub jobs: async_channel::Sender<ParsedRequest>,
    pub metrics: Arc<EngineMetrics>,
    pub max_body_size: usize,
}

/// Assembles the routing mux shared by both listeners: the evaluation
/// handler under the configured prefix, plus the service surface every
/// engine in the fleet exposes.
pub fn build_router(state: IngressState, path: &str) -> Router {
    let base = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint));
    let routed = if path == "/" {
        base.fallback(appsec_handler)
    } else {
        let prefix = path.trim_end_matches('/');
        base.route(prefix, any(appsec_handler))
            .route(&format!("{prefix}/*rest"), any(appsec_handler))
    };
    routed.with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<IngressState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn appsec_handler(
    State(state): State<IngressState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let remote_addr = connect
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unix".to_string());
    let source = normalize_source(&remote_addr);

    let Some(api_key) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
    else {
        error!(remote = %remote_addr, "request without api key header");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if !state.auth.authenticate(&api_key).await {
        error!(remote = %remote_addr, "api key rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (parsed, verdict_rx) = match parse_request(req, &state, &remote_addr).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(remote = %remote_addr, %err, "failed to parse forwarded request");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    state.metrics.record_request(&source, &state.engine);

    // Synchronous handoff to the runner pool; parks here while every
    // runner is busy. A closed queue means shutdown drain is under way.
    if state.jobs.send(parsed).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let verdict = match verdict_rx.await {
        Ok(verdict) => verdict,
        Err(_) => {
            error!(remote = %remote_addr, "reply channel dropped without a verdict");
            InBandVerdict::internal_error()
        }
    };

    if verdict.in_band_interrupt {
        state.metrics.record_block(&source, &state.engine);
    }

    write_verdict(verdict)
}

async fn parse_request(
    req: Request<Body>,
    state: &IngressState,
    remote_addr: &str,
) -> anyhow::Result<(ParsedRequest, oneshot::Receiver<InBandVerdict>)> {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, state.max_body_size)
        .await
        .map_err(|err| anyhow::anyhow!("body read failed: {err}"))?;
    let mut headers = parts.headers;
    // The engine's own authentication header never reaches rule evaluation
    // or event emission.
    headers.remove(API_KEY_HEADER);
    let client_ip = headers
        .get(CLIENT_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| normalize_source(remote_addr));
    Ok(ParsedRequest::new(
        state.engine.clone(),
        parts.method,
        parts.uri,
        headers,
        body,
        client_ip,
        remote_addr.to_string(),
    ))
}

fn write_verdict(verdict: InBandVerdict) -> Response {
    let status = StatusCode::from_u16(verdict.status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match serde_json::to_vec(&verdict.body) {
        Ok(buf) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(buf))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(err) => {
            error!(%err, "failed to serialize verdict body");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
