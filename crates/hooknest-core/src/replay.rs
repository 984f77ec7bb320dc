//! Ad-hoc replay of stored events to an arbitrary target URL.
//!
//! The stored event is fetched by id (timestamp fallback), its headers are
//! reconstructed minus hop-by-hop and masked values, idempotency headers
//! are added, and the request is re-issued with bounded retries. The
//! target URL passes the SSRF gate first.

use crate::error::Error;
use crate::forward::{Forwarder, is_transient_error};
use crate::security::{self, SsrfError};
use crate::store::EventStore;
use crate::types::{EventRecord, MASKED_SENTINEL};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Cap on the stored copy of the target's response body.
const TARGET_RESPONSE_BODY_CAP: usize = 64 * 1024;

/// Headers never replayed: hop-by-hop and transport metadata.
const STRIPPED_REPLAY_HEADERS: [&str; 10] = [
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "host",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Successful replay summary returned to the caller.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub status: &'static str,
    pub target_url: String,
    pub target_response_code: u16,
    pub target_response_body: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stripped_headers: Vec<String>,
}

/// Replay failure modes, mapped to statuses by the HTTP layer.
#[derive(Debug)]
pub enum ReplayError {
    /// No stored event matched the id or timestamp.
    EventNotFound,
    /// Target URL failed SSRF validation.
    UnsafeTarget(SsrfError),
    /// Every attempt timed out.
    Timeout { attempts: u32, per_attempt_ms: u64 },
    /// Non-timeout delivery failure.
    Delivery(String),
    /// Event store failure.
    Store(Error),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::EventNotFound => write!(f, "Event not found"),
            ReplayError::UnsafeTarget(e) => write!(f, "Target URL rejected: {}", e),
            ReplayError::Timeout {
                attempts,
                per_attempt_ms,
            } => write!(
                f,
                "Replay timed out after {} attempts of {} ms each",
                attempts, per_attempt_ms
            ),
            ReplayError::Delivery(msg) => write!(f, "Replay delivery failed: {}", msg),
            ReplayError::Store(e) => write!(f, "Event store failure: {}", e),
        }
    }
}

impl std::error::Error for ReplayError {}

/// Parse an item id as a timestamp for the fallback lookup: RFC 3339, unix
/// seconds, or unix milliseconds.
fn parse_timestamp(item_id: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(item_id) {
        return Some(ts.with_timezone(&Utc));
    }
    let n: i64 = item_id.parse().ok()?;
    if n > 100_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

/// Reconstruct the outbound header set from a stored event.
///
/// Returns the headers to send plus the names that were stripped (for the
/// response warning). Masked values are stripped too: a `[MASKED]`
/// credential would only confuse the target.
pub fn build_replay_headers(
    event: &EventRecord,
    canonical_host: &str,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut headers = BTreeMap::new();
    let mut stripped = Vec::new();
    for (name, value) in &event.headers {
        if STRIPPED_REPLAY_HEADERS.contains(&name.as_str()) || value == MASKED_SENTINEL {
            stripped.push(name.clone());
        } else {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers.insert("x-apify-replay".to_string(), "true".to_string());
    headers.insert(
        "x-original-webhook-id".to_string(),
        event.webhook_id.clone(),
    );
    headers.insert("idempotency-key".to_string(), event.id.clone());
    headers.insert("host".to_string(), canonical_host.to_string());
    (headers, stripped)
}

/// Replays stored events against external targets.
pub struct ReplayEngine {
    forwarder: Arc<Forwarder>,
    store: Arc<dyn EventStore>,
}

impl ReplayEngine {
    pub fn new(forwarder: Arc<Forwarder>, store: Arc<dyn EventStore>) -> Self {
        Self { forwarder, store }
    }

    /// Fetch the stored event: exact id match first, timestamp match only
    /// when the id lookup misses.
    pub async fn fetch_event(
        &self,
        webhook_id: &str,
        item_id: &str,
    ) -> Result<EventRecord, ReplayError> {
        if let Some(event) = self
            .store
            .find_by_id(webhook_id, item_id)
            .await
            .map_err(ReplayError::Store)?
        {
            return Ok(event);
        }
        if let Some(timestamp) = parse_timestamp(item_id)
            && let Some(event) = self
                .store
                .find_by_timestamp(webhook_id, timestamp)
                .await
                .map_err(ReplayError::Store)?
        {
            return Ok(event);
        }
        Err(ReplayError::EventNotFound)
    }

    /// Replay `(webhook_id, item_id)` against `target_url`.
    pub async fn replay(
        &self,
        webhook_id: &str,
        item_id: &str,
        target_url: &str,
        max_retries: u32,
        per_attempt_timeout: Duration,
    ) -> Result<ReplayOutcome, ReplayError> {
        let safe = security::validate_url(target_url)
            .await
            .map_err(ReplayError::UnsafeTarget)?;

        let event = self.fetch_event(webhook_id, item_id).await?;
        let (headers, stripped) = build_replay_headers(&event, &safe.host);

        let method = reqwest::Method::from_bytes(event.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let body = event.body_as_string();

        let attempts = max_retries.max(1);
        let mut timed_out = false;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let mut request = self
                .forwarder
                .client()
                .request(method.clone(), &safe.href)
                .timeout(per_attempt_timeout)
                .body(body.clone());
            for (name, value) in &headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(response) => {
                    let code = response.status().as_u16();
                    let mut text = response.text().await.unwrap_or_default();
                    text.truncate(TARGET_RESPONSE_BODY_CAP);
                    tracing::info!(
                        webhook_id,
                        event_id = %event.id,
                        target = %safe.href,
                        code,
                        attempt,
                        "Replayed event"
                    );
                    return Ok(ReplayOutcome {
                        status: "Replayed",
                        target_url: safe.href,
                        target_response_code: code,
                        target_response_body: text,
                        stripped_headers: stripped,
                    });
                }
                Err(e) => {
                    timed_out = e.is_timeout();
                    last_error = e.to_string();
                    let transient = is_transient_error(&e);
                    tracing::warn!(
                        target = %safe.href,
                        attempt,
                        transient,
                        error = %last_error,
                        "Replay attempt failed"
                    );
                    if !transient {
                        return Err(ReplayError::Delivery(last_error));
                    }
                    if attempt < attempts {
                        tokio::time::sleep(crate::forward::backoff_delay(attempt)).await;
                    }
                }
            }
        }

        if timed_out {
            Err(ReplayError::Timeout {
                attempts,
                per_attempt_ms: per_attempt_timeout.as_millis() as u64,
            })
        } else {
            Err(ReplayError::Delivery(last_error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventSink, MemoryEventStore};
    use crate::types::event_id;

    fn sample_event() -> EventRecord {
        let headers: BTreeMap<String, String> = [
            ("content-type", "application/json"),
            ("content-length", "2"),
            ("host", "origin.example.com"),
            ("authorization", MASKED_SENTINEL),
            ("x-custom", "keep"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        EventRecord {
            id: event_id(),
            timestamp: Utc::now(),
            webhook_id: "hook".to_string(),
            method: "POST".to_string(),
            headers,
            query: BTreeMap::new(),
            body: serde_json::json!({"x": 1}),
            content_type: Some("application/json".to_string()),
            size_bytes: 7,
            status_code: 200,
            response_body: None,
            response_headers: None,
            processing_time_ms: 1,
            remote_ip: None,
            user_agent: None,
            request_id: None,
            signature_valid: None,
            signature_provider: None,
            signature_error: None,
        }
    }

    fn engine(store: Arc<MemoryEventStore>) -> ReplayEngine {
        ReplayEngine::new(Arc::new(Forwarder::new("run_replay_test".to_string())), store)
    }

    #[test]
    fn replay_headers_strip_and_augment() {
        let event = sample_event();
        let (headers, stripped) = build_replay_headers(&event, "target.example.com");

        assert_eq!(headers["x-custom"], "keep");
        assert_eq!(headers["content-type"], "application/json");
        assert!(!headers.contains_key("content-length"));
        assert!(!headers.contains_key("authorization"));
        assert_eq!(headers["x-apify-replay"], "true");
        assert_eq!(headers["x-original-webhook-id"], "hook");
        assert_eq!(headers["idempotency-key"], event.id);
        assert_eq!(headers["host"], "target.example.com");

        assert!(stripped.contains(&"content-length".to_string()));
        assert!(stripped.contains(&"host".to_string()));
        assert!(stripped.contains(&"authorization".to_string()));
        assert!(!stripped.contains(&"x-custom".to_string()));
    }

    #[test]
    fn replay_headers_are_deterministic() {
        let event = sample_event();
        let first = build_replay_headers(&event, "t.example.com");
        let second = build_replay_headers(&event, "t.example.com");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn fetch_prefers_id_then_timestamp() {
        let store = Arc::new(MemoryEventStore::new());
        let event = sample_event();
        store.push(&event).await.unwrap();
        let engine = engine(store);

        let by_id = engine.fetch_event("hook", &event.id).await.unwrap();
        assert_eq!(by_id.id, event.id);

        let by_ts = engine
            .fetch_event("hook", &event.timestamp.to_rfc3339())
            .await
            .unwrap();
        assert_eq!(by_ts.id, event.id);

        let missing = engine.fetch_event("hook", "evt_nope").await;
        assert!(matches!(missing, Err(ReplayError::EventNotFound)));
    }

    #[tokio::test]
    async fn replay_rejects_unsafe_target_before_fetch() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = engine(store);
        let err = engine
            .replay("hook", "evt_x", "http://169.254.169.254/", 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::UnsafeTarget(_)));
    }

    #[test]
    fn timestamp_parsing_variants() {
        assert!(parse_timestamp("2025-06-01T12:00:00Z").is_some());
        assert!(parse_timestamp("1748779200").is_some());
        assert!(parse_timestamp("1748779200000").is_some());
        assert!(parse_timestamp("evt_abc123").is_none());
    }

    #[test]
    fn timeout_error_message_enumerates_attempts() {
        let err = ReplayError::Timeout {
            attempts: 3,
            per_attempt_ms: 10_000,
        };
        let text = err.to_string();
        assert!(text.contains('3'));
        assert!(text.contains("10000"));
    }
}
