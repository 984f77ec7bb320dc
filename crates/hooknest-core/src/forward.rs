//! Post-response background work: persist the event, forward it upstream
//! with retries, and fire alert channels — all bounded by a deadline.
//!
//! The deadline stops the *waiting*, not the work: subtasks are spawned
//! and keep running to completion best-effort after the orchestrator
//! stops awaiting them. Nothing in here ever propagates an error to the
//! client path.

use crate::config::ConfigSnapshot;
use crate::pipeline::{PipelineOutput, RECURSION_GUARD_HEADER};
use crate::security::{self, SsrfError};
use crate::store::EventSink;
use crate::types::{AlertTrigger, EventRecord, event_id};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Service identity stamped on every outbound request.
pub const SERVICE_NAME: &str = "hooknest";

/// Per-attempt forward timeout.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum forward attempts for transient failures.
pub const MAX_FORWARD_RETRIES: u32 = 3;

/// Alert channel send timeout.
const ALERT_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers never copied onto a forwarded request: credentials plus
/// hop-by-hop transport headers.
const STRIPPED_FORWARD_HEADERS: [&str; 12] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "api-key",
    "content-length",
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "proxy-connection",
    "upgrade",
];

/// Exponential backoff for retry `attempt` (1-based): 1s, 2s, 4s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(1000 * 2u64.pow(attempt.saturating_sub(1)))
}

/// Whether a reqwest error is worth retrying: timeouts, connect failures,
/// and DNS hiccups. Anything else aborts immediately.
pub fn is_transient_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    let text = error.to_string().to_ascii_lowercase();
    text.contains("dns") || text.contains("connection reset") || text.contains("unreachable")
}

/// Classify a sink failure for logging: platform quota noise gets an
/// advisory warning instead of an error.
pub fn is_platform_limit_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["dataset", "quota", "limit"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Build the outbound header set for a forward.
pub fn build_forward_headers(
    inbound: &BTreeMap<String, String>,
    copy_all: bool,
    canonical_host: &str,
    instance_id: &str,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if copy_all {
        for (name, value) in inbound {
            if !STRIPPED_FORWARD_HEADERS.contains(&name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }
    } else if let Some(ct) = inbound.get("content-type") {
        headers.insert("content-type".to_string(), ct.clone());
    }
    headers.insert("x-forwarded-by".to_string(), SERVICE_NAME.to_string());
    headers.insert(RECURSION_GUARD_HEADER.to_string(), instance_id.to_string());
    headers.insert("host".to_string(), canonical_host.to_string());
    headers
}

/// Decide whether the event trips any configured alert trigger.
pub fn should_alert(
    snapshot: &ConfigSnapshot,
    event: &EventRecord,
    error_text: Option<&str>,
) -> Option<AlertTrigger> {
    snapshot.alert_on.iter().copied().find(|trigger| match trigger {
        AlertTrigger::Error => error_text.is_some(),
        AlertTrigger::ClientError => (400..500).contains(&event.status_code),
        AlertTrigger::ServerError => (500..600).contains(&event.status_code),
        AlertTrigger::Timeout => error_text
            .map(|t| t.to_ascii_lowercase().contains("timeout"))
            .unwrap_or(false),
        AlertTrigger::SignatureInvalid => event.signature_valid == Some(false),
    })
}

/// Outbound HTTP for forwards and alerts, pinned to one instance identity.
pub struct Forwarder {
    client: reqwest::Client,
    instance_id: String,
}

impl Forwarder {
    pub fn new(instance_id: String) -> Self {
        // Redirects are never followed: a 302 to an internal address would
        // bypass the SSRF gate.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("hooknest/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Everything one background run needs, handed over by value.
pub struct BackgroundTask {
    pub snapshot: Arc<ConfigSnapshot>,
    pub output: PipelineOutput,
    pub sink: Arc<dyn EventSink>,
    pub forwarder: Arc<Forwarder>,
    pub deadline: Duration,
    /// Error text from the request path, if any (feeds alert triggers).
    pub error_text: Option<String>,
}

/// Run persist + forward + alert under the deadline. Spawned subtasks
/// outlive an elapsed deadline.
pub async fn run_background_tasks(task: BackgroundTask) {
    let BackgroundTask {
        snapshot,
        output,
        sink,
        forwarder,
        deadline,
        error_text,
    } = task;

    let event = Arc::new(output.event);

    let persist = {
        let sink = Arc::clone(&sink);
        let event = Arc::clone(&event);
        tokio::spawn(async move { persist_event(&*sink, &event).await })
    };

    let forward = output.forward_url.clone().map(|url| {
        let forwarder = Arc::clone(&forwarder);
        let sink = Arc::clone(&sink);
        let event = Arc::clone(&event);
        let raw_body = output.raw_body.clone();
        let inbound_headers = output.inbound_headers.clone();
        let copy_all = output.forward_headers;
        tokio::spawn(async move {
            forward_event(&forwarder, &*sink, &event, &url, raw_body, inbound_headers, copy_all)
                .await;
        })
    });

    let alert = {
        let snapshot = Arc::clone(&snapshot);
        let forwarder = Arc::clone(&forwarder);
        let event = Arc::clone(&event);
        tokio::spawn(async move {
            if let Some(trigger) = should_alert(&snapshot, &event, error_text.as_deref()) {
                send_alerts(&forwarder, &snapshot, &event, trigger).await;
            }
        })
    };

    let join_all = async {
        let _ = persist.await;
        if let Some(handle) = forward {
            let _ = handle.await;
        }
        let _ = alert.await;
    };

    if tokio::time::timeout(deadline, join_all).await.is_err() {
        tracing::warn!(
            deadline_ms = deadline.as_millis() as u64,
            "[TIMEOUT] background tasks exceeded deadline; letting them finish unobserved"
        );
    }
}

async fn persist_event(sink: &dyn EventSink, event: &EventRecord) {
    if let Err(e) = sink.push(event).await {
        let message = e.to_string();
        if is_platform_limit_error(&message) {
            tracing::warn!(
                event_id = %event.id,
                error = %message,
                "Event persistence hit a platform limit; continuing"
            );
        } else {
            tracing::error!(event_id = %event.id, error = %message, "Failed to persist event");
        }
    }
}

async fn forward_event(
    forwarder: &Forwarder,
    sink: &dyn EventSink,
    event: &EventRecord,
    url: &str,
    raw_body: Bytes,
    inbound_headers: BTreeMap<String, String>,
    copy_all_headers: bool,
) {
    let safe = match security::validate_url(url).await {
        Ok(safe) => safe,
        Err(e) => {
            tracing::warn!(url = %url, reason = %e, "SSRF blocked forward target");
            return;
        }
    };

    let headers = build_forward_headers(
        &inbound_headers,
        copy_all_headers,
        &safe.host,
        forwarder.instance_id(),
    );
    let method = reqwest::Method::from_bytes(event.method.as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut last_error: Option<reqwest::Error> = None;
    for attempt in 1..=MAX_FORWARD_RETRIES {
        let mut request = forwarder
            .client()
            .request(method.clone(), &safe.href)
            .timeout(FORWARD_TIMEOUT)
            .body(raw_body.clone());
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_client_error() || status.is_server_error() {
                    tracing::warn!(url = %safe.href, %status, "Forward target returned an error");
                    write_forward_error(
                        sink,
                        event,
                        &safe.href,
                        false,
                        attempt,
                        &format!("upstream returned {}", status),
                    )
                    .await;
                } else {
                    tracing::debug!(url = %safe.href, %status, attempt, "Forwarded event");
                }
                return;
            }
            Err(e) => {
                let transient = is_transient_error(&e);
                tracing::warn!(
                    url = %safe.href,
                    attempt,
                    transient,
                    error = %e,
                    "Forward attempt failed"
                );
                if !transient {
                    write_forward_error(sink, event, &safe.href, false, attempt, &e.to_string())
                        .await;
                    return;
                }
                last_error = Some(e);
                if attempt < MAX_FORWARD_RETRIES {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    write_forward_error(sink, event, &safe.href, true, MAX_FORWARD_RETRIES, &reason).await;
}

/// Record an exhausted or aborted forward as a synthetic event so the
/// failure is visible in the log stream and dataset.
async fn write_forward_error(
    sink: &dyn EventSink,
    source: &EventRecord,
    url: &str,
    transient: bool,
    attempts: u32,
    last_error: &str,
) {
    let synthetic = EventRecord {
        id: event_id(),
        timestamp: Utc::now(),
        webhook_id: source.webhook_id.clone(),
        method: "FORWARD".to_string(),
        headers: BTreeMap::new(),
        query: BTreeMap::new(),
        body: serde_json::json!({
            "type": "forward_error",
            "url": url,
            "transient": transient,
            "attempts": attempts,
            "lastError": last_error,
            "sourceEventId": source.id,
        }),
        content_type: Some("application/json".to_string()),
        size_bytes: 0,
        status_code: 502,
        response_body: None,
        response_headers: None,
        processing_time_ms: 0,
        remote_ip: None,
        user_agent: None,
        request_id: source.request_id.clone(),
        signature_valid: None,
        signature_provider: None,
        signature_error: None,
    };
    if let Err(e) = sink.push(&synthetic).await {
        tracing::error!(error = %e, "Failed to record forward_error event");
    }
}

async fn send_alerts(
    forwarder: &Forwarder,
    snapshot: &ConfigSnapshot,
    event: &EventRecord,
    trigger: AlertTrigger,
) {
    let Some(alerts) = &snapshot.alerts else {
        return;
    };

    if let Some(slack) = &alerts.slack {
        let payload = slack_payload(event, trigger);
        send_alert_payload(forwarder, &slack.webhook_url, payload, "slack").await;
    }
    if let Some(discord) = &alerts.discord {
        let payload = discord_payload(event, trigger);
        send_alert_payload(forwarder, &discord.webhook_url, payload, "discord").await;
    }
}

fn trigger_label(trigger: AlertTrigger) -> &'static str {
    match trigger {
        AlertTrigger::Error => "error",
        AlertTrigger::ClientError => "4xx response",
        AlertTrigger::ServerError => "5xx response",
        AlertTrigger::Timeout => "timeout",
        AlertTrigger::SignatureInvalid => "invalid signature",
    }
}

fn slack_payload(event: &EventRecord, trigger: AlertTrigger) -> serde_json::Value {
    serde_json::json!({
        "blocks": [
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(
                        "*hooknest alert: {}*\nwebhook `{}` event `{}` status `{}`",
                        trigger_label(trigger), event.webhook_id, event.id, event.status_code
                    )
                }
            },
            {
                "type": "context",
                "elements": [{
                    "type": "mrkdwn",
                    "text": format!("{} {} at {}", event.method, event.webhook_id, event.timestamp.to_rfc3339())
                }]
            }
        ]
    })
}

fn discord_payload(event: &EventRecord, trigger: AlertTrigger) -> serde_json::Value {
    serde_json::json!({
        "embeds": [{
            "title": format!("hooknest alert: {}", trigger_label(trigger)),
            "description": format!(
                "webhook `{}` event `{}` responded `{}`",
                event.webhook_id, event.id, event.status_code
            ),
            "timestamp": event.timestamp.to_rfc3339(),
        }]
    })
}

async fn send_alert_payload(
    forwarder: &Forwarder,
    url: &str,
    payload: serde_json::Value,
    channel: &str,
) {
    let safe = match security::validate_url(url).await {
        Ok(safe) => safe,
        Err(e @ SsrfError::InternalIp(_)) => {
            tracing::warn!(channel, reason = %e, "SSRF blocked alert channel");
            return;
        }
        Err(e) => {
            tracing::warn!(channel, reason = %e, "Invalid alert channel URL");
            return;
        }
    };

    let result = forwarder
        .client()
        .post(&safe.href)
        .timeout(ALERT_TIMEOUT)
        .json(&payload)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(channel, "Alert delivered");
        }
        Ok(response) => {
            tracing::warn!(channel, status = %response.status(), "Alert channel rejected payload");
        }
        Err(e) => {
            tracing::warn!(channel, error = %e, "Alert delivery failed");
        }
    }
}
