//! Domain types for hooknest

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel value substituted for masked header values.
pub const MASKED_SENTINEL: &str = "[MASKED]";

/// Headers masked in persisted events when `mask_sensitive_data` is on.
/// Compared case-insensitively (header maps are lowercased at ingest).
pub const SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "api-key",
];

/// Mint an opaque alphanumeric token of the given length.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

/// Mint a short event id (`evt_` prefix).
pub fn event_id() -> String {
    format!("evt_{}", random_token(12))
}

/// Mint a request id (`req_` prefix), used when the client did not send one.
pub fn request_id() -> String {
    format!("req_{}", random_token(12))
}

/// Mask sensitive header values in place, returning the masked map.
pub fn mask_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            if SENSITIVE_HEADERS.contains(&k.as_str()) {
                (k.clone(), MASKED_SENTINEL.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

// === Webhook registry types ===

/// Per-webhook response/forward overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_headers: Option<bool>,
}

impl WebhookOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A provisioned webhook endpoint.
///
/// Valid iff present in the registry and `now < expires_at`. Retention is
/// monotone: `expires_at` only ever moves forward. The TTL sweep is the sole
/// destructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRecord {
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<WebhookOverrides>,
}

impl WebhookRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// === Event record ===

/// The immutable record produced from one inbound request.
///
/// Created by the ingestion pipeline, handed by value to the background
/// orchestrator and the event bus, appended to the external sink. Never
/// mutated after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub webhook_id: String,
    pub method: String,
    /// Lowercased header names; sensitive values masked per policy.
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    /// Parsed JSON when JSON parsing applied, else the raw body as a string.
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_error: Option<String>,
}

impl EventRecord {
    /// Body rendered as a string: raw strings pass through, JSON is
    /// re-serialized compactly.
    pub fn body_as_string(&self) -> String {
        match &self.body {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// === Alerting ===

/// Conditions that can trigger an alert for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTrigger {
    /// Any error raised while handling or forwarding the event.
    Error,
    /// Response status in [400, 500).
    #[serde(rename = "4xx")]
    ClientError,
    /// Response status in [500, 600).
    #[serde(rename = "5xx")]
    ServerError,
    /// Error text contains "timeout".
    Timeout,
    /// Signature verification was configured and failed.
    SignatureInvalid,
}
