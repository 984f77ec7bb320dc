//! HTTP request handlers for hooknest-api

use crate::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use hooknest_core::{
    ConfigSnapshot, InboundRequest, LogQuery, PipelineError, PipelineOutput, ReplayError,
    auth::{AuthError, validate_auth},
    ratelimit,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// SSE heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Error response format
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Convert internal errors to HTTP responses.
///
/// Logs the actual error server-side but returns a generic message to
/// clients to avoid leaking internal details.
fn internal_error(err: impl std::fmt::Display) -> Response {
    tracing::error!("Internal error: {}", err);
    let body = Json(ErrorResponse {
        error: "Internal Server Error".to_string(),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

/// Structured error body: `{"error": <message>, ...details}`.
fn error_response(status: u16, message: &str, details: Option<serde_json::Value>) -> Response {
    let mut body = serde_json::json!({ "error": message });
    if let (Some(obj), Some(serde_json::Value::Object(extra))) = (body.as_object_mut(), details) {
        for (k, v) in extra {
            obj.insert(k, v);
        }
    }
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

/// Lowercase the header map (first value per name) and collect every
/// `Authorization` value separately so duplicates can be rejected.
fn lower_headers(headers: &HeaderMap) -> (BTreeMap<String, String>, Vec<String>) {
    let mut map = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }
    let authorization = headers
        .get_all(header::AUTHORIZATION)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    (map, authorization)
}

fn parse_query(uri: &Uri) -> BTreeMap<String, String> {
    axum::extract::Query::<BTreeMap<String, String>>::try_from_uri(uri)
        .map(|q| q.0)
        .unwrap_or_default()
}

fn remote_ip_of(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Shared per-route gate: derive the client key, then rate-limit on it.
/// Returns the client IP for downstream whitelist checks.
fn client_gate(
    state: &AppState,
    headers: &BTreeMap<String, String>,
    remote: Option<IpAddr>,
) -> Result<Option<IpAddr>, Response> {
    let trust_proxy = state.hooknest.server_config().behind_proxy;
    let key = match ratelimit::client_key(remote, headers, trust_proxy) {
        Ok(key) => key,
        Err(e) => {
            return Err(error_response(400, &e.message(), None));
        }
    };

    let limiter = state.hooknest.limiter();
    let decision = limiter.check(&key);
    if !decision.allowed {
        let retry_after_ms = decision.retry_after_ms.unwrap_or(0);
        let mut response = error_response(
            429,
            &format!(
                "Rate limit exceeded: {} requests per {} ms window",
                limiter.limit(),
                limiter.window().as_millis()
            ),
            None,
        );
        let retry_secs = retry_after_ms.div_ceil(1000).max(1);
        if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return Err(response);
    }

    Ok(key.parse::<IpAddr>().ok())
}

fn check_auth(
    snapshot: &ConfigSnapshot,
    authorization: &[String],
    query: &BTreeMap<String, String>,
) -> Result<(), Response> {
    match validate_auth(&snapshot.auth_key, authorization, query) {
        Ok(()) => Ok(()),
        Err(e) => {
            let message = match e {
                AuthError::MissingToken => "Authentication required",
                _ => e.message(),
            };
            Err(error_response(401, message, None))
        }
    }
}

/// Render the pipeline's response: strings go out as text, anything else
/// as JSON; merged headers are applied on top.
fn render_response(output: &PipelineOutput) -> Response {
    let status = StatusCode::from_u16(output.response_status).unwrap_or(StatusCode::OK);
    let mut response = match &output.response_body {
        serde_json::Value::String(s) => s.clone().into_response(),
        other => Json(other.clone()).into_response(),
    };
    *response.status_mut() = status;
    for (name, value) in &output.response_headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            value.parse::<HeaderValue>(),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

// === Handlers ===

/// ALL /webhook/{id} - the ingestion pipeline entry point
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    let start = Instant::now();
    // The whole request runs against the snapshot captured here.
    let snapshot = state.hooknest.snapshot();

    let remote = remote_ip_of(&request);
    let (parts, body) = request.into_parts();
    let (headers, authorization_values) = lower_headers(&parts.headers);
    let query = parse_query(&parts.uri);

    let remote_ip = match client_gate(&state, &headers, remote) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    // The body reader enforces the cap independently of the pipeline's
    // Content-Length check; both produce 413.
    let body = match axum::body::to_bytes(body, snapshot.max_payload_bytes as usize).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                413,
                &format!(
                    "Payload exceeds the maximum size of {} bytes",
                    snapshot.max_payload_bytes
                ),
                None,
            );
        }
    };

    let inbound = InboundRequest {
        webhook_id: id,
        method: parts.method.as_str().to_string(),
        headers,
        authorization_values,
        query,
        body,
        remote_ip,
    };

    match state.hooknest.handle_request(inbound, &snapshot).await {
        Ok(mut output) => {
            if !output.delay.is_zero() {
                tokio::time::sleep(output.delay).await;
            }
            output.event.processing_time_ms = start.elapsed().as_millis().max(1) as u64;
            let response = render_response(&output);
            state.hooknest.dispatch_background(snapshot, output, None);
            response
        }
        Err(PipelineError {
            status,
            message,
            details,
        }) => {
            if status >= 500 {
                internal_error(message)
            } else {
                error_response(status, &message, details)
            }
        }
    }
}

/// GET|POST /replay/{webhook_id}/{item_id}?url=... - replay a stored event
pub async fn replay(
    State(state): State<Arc<AppState>>,
    Path((webhook_id, item_id)): Path<(String, String)>,
    request: Request,
) -> Response {
    let snapshot = state.hooknest.snapshot();
    let remote = remote_ip_of(&request);
    let (headers, authorization_values) = lower_headers(request.headers());
    let query = parse_query(request.uri());

    if let Err(response) = check_auth(&snapshot, &authorization_values, &query) {
        return response;
    }
    if let Err(response) = client_gate(&state, &headers, remote) {
        return response;
    }

    let Some(target_url) = query.get("url").filter(|u| !u.is_empty()) else {
        return error_response(400, "Missing url query parameter", None);
    };

    match state.hooknest.replay(&webhook_id, &item_id, target_url).await {
        Ok(outcome) => {
            let stripped = outcome.stripped_headers.join(", ");
            let mut response = Json(&outcome).into_response();
            if !stripped.is_empty()
                && let Ok(value) = HeaderValue::from_str(&stripped)
            {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-stripped-headers"), value);
            }
            response
        }
        Err(ReplayError::EventNotFound) => error_response(404, "Event not found", None),
        Err(e @ ReplayError::UnsafeTarget(_)) => error_response(400, &e.to_string(), None),
        Err(e @ ReplayError::Timeout { .. }) => error_response(504, &e.to_string(), None),
        Err(e) => internal_error(e),
    }
}

/// GET /log-stream - live SSE stream of ingested events
pub async fn log_stream(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let snapshot = state.hooknest.snapshot();
    let (_, authorization_values) = lower_headers(request.headers());
    let query = parse_query(request.uri());
    if let Err(response) = check_auth(&snapshot, &authorization_values, &query) {
        return response;
    }

    let Some(subscription) = state.hooknest.subscribe() else {
        return error_response(
            503,
            "Too many live subscribers; try again later",
            None,
        );
    };

    let stream = futures_util::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let data = serde_json::to_string(&*event).unwrap_or_else(|_| "{}".to_string());
        Some((
            Ok::<Event, std::convert::Infallible>(Event::default().data(data)),
            subscription,
        ))
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(HEARTBEAT_INTERVAL)
                .text("heartbeat"),
        )
        .into_response()
}

/// GET /logs - query recorded events
pub async fn logs(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let snapshot = state.hooknest.snapshot();
    let (_, authorization_values) = lower_headers(request.headers());
    let query = parse_query(request.uri());
    if let Err(response) = check_auth(&snapshot, &authorization_values, &query) {
        return response;
    }

    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100)
        .min(1000);
    let webhook_id = query
        .get("webhookId")
        .or_else(|| query.get("webhook_id"))
        .cloned();
    let since = query
        .get("since")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&chrono::Utc));

    let log_query = LogQuery {
        webhook_id,
        since,
        limit,
    };
    match state.hooknest.query_logs(&log_query).await {
        Ok(events) => {
            #[derive(Serialize)]
            struct LogsResponse {
                events: Vec<hooknest_core::EventRecord>,
                count: usize,
            }
            let count = events.len();
            Json(LogsResponse { events, count }).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /info - runtime metadata with a masked config summary
pub async fn info(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let snapshot = state.hooknest.snapshot();
    let (_, authorization_values) = lower_headers(request.headers());
    let query = parse_query(request.uri());
    if let Err(response) = check_auth(&snapshot, &authorization_values, &query) {
        return response;
    }

    let body = serde_json::json!({
        "service": hooknest_core::forward::SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "instanceId": state.hooknest.instance_id(),
        "uptimeSeconds": state.hooknest.uptime().as_secs(),
        "activeWebhooks": state.hooknest.registry().list().len(),
        "liveSubscribers": state.hooknest.subscriber_count(),
        "config": {
            "urlCount": snapshot.url_count,
            "retentionHours": snapshot.retention_hours,
            "rateLimitPerMinute": snapshot.rate_limit_per_minute,
            "maxPayloadBytes": snapshot.max_payload_bytes,
            "authRequired": !snapshot.auth_key.is_empty(),
            "forwardUrl": snapshot.forward_url,
            "forwardHeaders": snapshot.forward_headers,
            "maskSensitiveData": snapshot.mask_sensitive_data,
            "signatureProvider": snapshot
                .signature
                .as_ref()
                .map(|s| s.provider.as_str()),
            "alertOn": snapshot.alert_on,
            "replayMaxRetries": snapshot.replay_max_retries,
            "replayTimeoutMs": snapshot.replay_timeout_ms,
        },
    });
    Json(body).into_response()
}

/// Readiness-probe header recognized on the dashboard route.
pub const READINESS_PROBE_HEADER: &str = "x-apify-container-server-readiness-probe";

/// GET / - dashboard shell; readiness probes short-circuit without auth
pub async fn dashboard(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if request.headers().contains_key(READINESS_PROBE_HEADER) {
        return "OK".into_response();
    }

    let webhooks = state.hooknest.registry().list().len();
    let html = format!(
        "<!DOCTYPE html>\n<html><head><title>hooknest</title></head>\
         <body><h1>hooknest</h1>\
         <p>{} active webhook endpoint(s). Stream events at <code>/log-stream</code>, \
         query them at <code>/logs</code>.</p></body></html>",
        webhooks
    );

    let mut response = axum::response::Html(html).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; style-src 'unsafe-inline'"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}
