//! HTTP transport — JSON-RPC over POST and the sanitized SSE stream proxy.
//!
//! The POST path is plain request/response: intercept, then either return
//! the blocking error (403) or forward the original bytes unmodified and
//! relay the upstream answer verbatim. The SSE path is a long-lived proxy
//! of the upstream event stream where each event's `data:` fields are
//! reassembled, inspected, and substituted with the blocking response when
//! the verdict is BLOCK. Buffering never grows past one event plus a
//! partial line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::audit::AuditLogger;
use crate::config::FirewallConfig;
use crate::error::Error;
use crate::escalation::EscalationHub;
use crate::interceptor::FirewallEngine;
use crate::protocol::{JsonRpcResponse, CODE_UPSTREAM_ERROR};
use crate::session::{SessionStore, SharedSession};

use super::{resolve_blocking, RateLimiter, MAX_MESSAGE_BYTES, UPSTREAM_TIMEOUT};

/// Everything the HTTP and WebSocket handlers share.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<FirewallConfig>,
    pub engine: Arc<FirewallEngine>,
    pub sessions: Arc<SessionStore>,
    pub hub: Arc<EscalationHub>,
    pub audit: Option<Arc<AuditLogger>>,
    /// Client for request/response forwarding, bounded by the upstream timeout.
    pub http: reqwest::Client,
    /// Client for long-lived streams; no total-request timeout.
    pub stream_http: reqwest::Client,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl ProxyState {
    pub fn new(
        config: Arc<FirewallConfig>,
        engine: Arc<FirewallEngine>,
        sessions: Arc<SessionStore>,
        hub: Arc<EscalationHub>,
        audit: Option<Arc<AuditLogger>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let stream_http = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests_per_sec,
            config.rate_limit_burst,
        ));
        Self {
            config,
            engine,
            sessions,
            hub,
            audit,
            http,
            stream_http,
            limiter,
            started_at: Instant::now(),
        }
    }
}

/// Build the firewall's HTTP surface.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/mcp", post(handle_post))
        .route("/mcp/sse", get(handle_sse))
        .route("/ws/mcp", get(super::ws::handle_proxy_socket))
        .route("/ws/operator", get(super::ws::handle_operator_socket))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Session/agent identity from headers, with a transport-derived fallback.
pub(super) fn session_identity(
    headers: &HeaderMap,
    fallback_session: &str,
    default_agent: &str,
) -> (String, String) {
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(fallback_session)
        .to_string();
    let agent_id = headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(default_agent)
        .to_string();
    (session_id, agent_id)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok", "service": "agent-firewall"}))
}

async fn stats(State(state): State<ProxyState>) -> impl IntoResponse {
    axum::Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "active_sessions": state.sessions.active_count().await,
        "operator_clients": state.hub.subscriber_count(),
        "pending_escalations": state.hub.pending_count().await,
        "audit": {
            "written": state.audit.as_ref().map(|a| a.written()).unwrap_or(0),
            "dropped": state.audit.as_ref().map(|a| a.dropped()).unwrap_or(0),
        },
    }))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Classify an upstream transport failure.
fn upstream_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(UPSTREAM_TIMEOUT.as_millis() as u64)
    } else {
        Error::upstream(err.to_string())
    }
}

/// JSON-RPC over HTTP POST.
async fn handle_post(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.limiter.allow() {
        warn!(%peer, "rate limit exceeded");
        return json_response(
            StatusCode::TOO_MANY_REQUESTS,
            br#"{"error":"rate limit exceeded"}"#.to_vec(),
        );
    }

    let (session_id, agent_id) = session_identity(&headers, &peer.to_string(), "http-agent");
    let session = state.sessions.get_or_create(&session_id, &agent_id).await;

    let interception = state.engine.intercept(&body, &session).await;
    if let Some(blocking) =
        resolve_blocking(&state.hub, &interception, &session_id, &agent_id).await
    {
        return json_response(StatusCode::FORBIDDEN, blocking.to_bytes());
    }

    forward_to_upstream(&state, &interception.request.id, body).await
}

/// Forward the original bytes unmodified and relay the upstream response.
async fn forward_to_upstream(
    state: &ProxyState,
    request_id: &Option<crate::protocol::RequestId>,
    body: Bytes,
) -> Response {
    let url = format!("{}/mcp", state.config.upstream_http_url());
    let outcome = state
        .http
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-by", "agent-firewall")
        .body(body)
        .send()
        .await;

    match outcome {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let bytes = upstream.bytes().await.unwrap_or_default();
            (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(err) => {
            let err = upstream_error(err);
            error!(error = %err, "upstream request failed");
            let response = JsonRpcResponse::error(
                request_id.clone(),
                CODE_UPSTREAM_ERROR,
                err.to_string(),
                None,
            );
            json_response(StatusCode::BAD_GATEWAY, response.to_bytes())
        }
    }
}

// ── SSE stream proxy ────────────────────────────────────────────────

/// One reassembled SSE event, split into data and non-data lines.
#[derive(Debug, PartialEq)]
pub(super) struct SseEvent {
    pub data: Vec<String>,
    pub other: Vec<String>,
}

impl SseEvent {
    pub(super) fn parse(raw: &str) -> Self {
        let mut data = Vec::new();
        let mut other = Vec::new();
        for line in raw.split('\n') {
            match line.strip_prefix("data:") {
                Some(rest) => data.push(rest.trim_start().to_string()),
                None => other.push(line.to_string()),
            }
        }
        Self { data, other }
    }

    /// The event's payload: all data lines joined.
    pub(super) fn payload(&self) -> String {
        self.data.join("\n")
    }

    /// Rebuild the event with the data fields replaced. Non-data lines
    /// (event names, ids, comments) are preserved.
    pub(super) fn with_replaced_data(&self, replacement: &str) -> String {
        let mut lines: Vec<&str> = self
            .other
            .iter()
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        let data_line = format!("data:{replacement}");
        lines.push(&data_line);
        lines.join("\n")
    }
}

/// Proxy the upstream SSE stream, sanitizing event-by-event.
async fn handle_sse(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let (session_id, agent_id) =
        session_identity(&headers, &format!("sse-{peer}"), "sse-agent");
    let session = state.sessions.get_or_create(&session_id, &agent_id).await;

    let url = format!("{}/sse", state.config.upstream_http_url());
    let upstream = match state.stream_http.get(&url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            let err = upstream_error(err);
            error!(error = %err, "upstream SSE connect failed");
            let response =
                JsonRpcResponse::error(None, CODE_UPSTREAM_ERROR, err.to_string(), None);
            return json_response(StatusCode::BAD_GATEWAY, response.to_bytes());
        }
    };

    info!(session = %session_id, "SSE stream opened");

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::spawn(async move {
        let mut body = upstream.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(error = %err, "upstream SSE read error");
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            // Events are delimited by blank lines.
            while let Some(pos) = find_delimiter(&buffer) {
                let event_bytes: Vec<u8> = buffer.drain(..pos + 2).take(pos).collect();
                let sanitized = sanitize_sse_event(&state, &event_bytes, &session).await;
                let mut out = sanitized;
                out.extend_from_slice(b"\n\n");
                if tx.send(Ok(Bytes::from(out))).await.is_err() {
                    return; // client went away
                }
            }

            if buffer.len() > MAX_MESSAGE_BYTES {
                warn!(bytes = buffer.len(), "oversized SSE event dropped");
                buffer.clear();
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-agent-firewall"), "active"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Inspect one SSE event. Events without data fields and events whose data
/// is not JSON pass through untouched; JSON-RPC data runs through the
/// engine and is replaced by the blocking response on BLOCK.
async fn sanitize_sse_event(
    state: &ProxyState,
    event_bytes: &[u8],
    session: &SharedSession,
) -> Vec<u8> {
    let text = String::from_utf8_lossy(event_bytes);
    let event = SseEvent::parse(&text);
    if event.data.is_empty() {
        return event_bytes.to_vec();
    }

    let payload = event.payload();
    if serde_json::from_str::<Value>(&payload).is_err() {
        return event_bytes.to_vec();
    }

    let interception = state.engine.intercept(payload.as_bytes(), session).await;
    match interception.blocking {
        Some(blocking) => {
            let replacement = String::from_utf8_lossy(&blocking.to_bytes()).into_owned();
            event.with_replaced_data(&replacement).into_bytes()
        }
        None => event_bytes.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sse_event_parse_splits_fields() {
        let event = SseEvent::parse("event: message\ndata: {\"a\":1}\ndata: more");
        assert_eq!(event.other, vec!["event: message".to_string()]);
        assert_eq!(event.data, vec!["{\"a\":1}".to_string(), "more".to_string()]);
        assert_eq!(event.payload(), "{\"a\":1}\nmore");
    }

    #[test]
    fn test_sse_event_without_data() {
        let event = SseEvent::parse(": keep-alive comment");
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_sse_replace_preserves_non_data_lines() {
        let event = SseEvent::parse("event: message\nid: 7\ndata: {\"x\":1}");
        let rebuilt = event.with_replaced_data("{\"error\":\"blocked\"}");
        assert_eq!(
            rebuilt,
            "event: message\nid: 7\ndata:{\"error\":\"blocked\"}"
        );
    }

    #[test]
    fn test_find_delimiter() {
        assert_eq!(find_delimiter(b"data: x\n\nrest"), Some(7));
        assert_eq!(find_delimiter(b"partial line"), None);
    }

    #[test]
    fn test_session_identity_prefers_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "sess-9".parse().unwrap());
        headers.insert("x-agent-id", "agent-7".parse().unwrap());
        let (session, agent) = session_identity(&headers, "fallback", "default-agent");
        assert_eq!(session, "sess-9");
        assert_eq!(agent, "agent-7");
    }

    #[test]
    fn test_session_identity_falls_back_to_transport() {
        let headers = HeaderMap::new();
        let (session, agent) = session_identity(&headers, "127.0.0.1:4100", "http-agent");
        assert_eq!(session, "127.0.0.1:4100");
        assert_eq!(agent, "http-agent");
    }
}
