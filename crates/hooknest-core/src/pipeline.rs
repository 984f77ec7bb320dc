//! The per-request ingestion pipeline.
//!
//! Transport-agnostic: the HTTP layer lowers a request into an
//! [`InboundRequest`], the pipeline runs the ordered steps (webhook
//! validity, IP whitelist, auth, size cap, body parsing, schema check,
//! signature verification, event build, script transform) and returns
//! either a [`PipelineOutput`] to render or a [`PipelineError`] carrying
//! the status to map. Signature failure never short-circuits: the event
//! records the outcome and the response proceeds.

use crate::auth::{AuthError, validate_auth};
use crate::config::{ConfigSnapshot, SAFE_RESPONSE_DELAY_MAX_MS};
use crate::registry::WebhookRegistry;
use crate::sandbox::ScriptSandbox;
use crate::schema::SchemaValidator;
use crate::signature::verify_signature;
use crate::types::{EventRecord, WebhookOverrides, event_id, mask_headers, request_id};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// Header stamped on forwarded requests and checked at ingest to break
/// forwarding loops.
pub const RECURSION_GUARD_HEADER: &str = "x-forwarded-by-run";

/// A transport-lowered inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub webhook_id: String,
    pub method: String,
    /// Lowercased header names, first value per name.
    pub headers: BTreeMap<String, String>,
    /// Every `Authorization` value as received (duplicates preserved so the
    /// auth gate can reject them).
    pub authorization_values: Vec<String>,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
    pub remote_ip: Option<IpAddr>,
}

/// The explicit error sum for pipeline failures; the HTTP layer maps it to
/// a status plus a structured JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineError {
    pub status: u16,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl PipelineError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(status: u16, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status,
            message: message.into(),
            details: Some(details),
        }
    }
}

/// What to send back, plus everything the background orchestrator needs.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub event: EventRecord,
    pub response_status: u16,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: serde_json::Value,
    /// Already clamped to the safe maximum.
    pub delay: Duration,
    /// Effective forward target (per-webhook override beats global).
    pub forward_url: Option<String>,
    pub forward_headers: bool,
    /// Byte-exact body for forwarding.
    pub raw_body: Bytes,
    /// Unmasked inbound headers for outbound header reconstruction.
    pub inbound_headers: BTreeMap<String, String>,
}

/// Shared collaborators the pipeline consults.
pub struct PipelineContext<'a> {
    pub snapshot: &'a ConfigSnapshot,
    pub registry: &'a WebhookRegistry,
    pub sandbox: &'a ScriptSandbox,
    pub schemas: &'a SchemaValidator,
    pub instance_id: &'a str,
    pub script_timeout: Duration,
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.contains("application/json") || ct.contains("+json")
    })
}

fn effective_status(
    query: &BTreeMap<String, String>,
    overrides: Option<&WebhookOverrides>,
    snapshot: &ConfigSnapshot,
) -> u16 {
    if let Some(raw) = query.get("__status")
        && let Ok(code) = raw.parse::<u16>()
        && (100..600).contains(&code)
    {
        return code;
    }
    overrides
        .and_then(|o| o.response_code)
        .unwrap_or(snapshot.default_response_code)
}

/// Apply the user script to the event via a JSON round-trip. A script that
/// corrupts the record shape leaves the original untouched.
async fn apply_transform(
    ctx: &PipelineContext<'_>,
    source: &str,
    event: EventRecord,
) -> EventRecord {
    let original = event.clone();
    let value = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize event for script; skipping transform");
            return original;
        }
    };
    let Some(mutated) = ctx.sandbox.run(source, value, ctx.script_timeout).await else {
        return original;
    };
    match serde_json::from_value::<EventRecord>(mutated) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Script produced an invalid event shape; keeping original");
            original
        }
    }
}

/// Run the ordered pipeline for one request.
pub async fn run_pipeline(
    req: InboundRequest,
    ctx: &PipelineContext<'_>,
) -> Result<PipelineOutput, PipelineError> {
    let snapshot = ctx.snapshot;

    // 1a. Recursion guard: our own forwarded requests bounce here.
    if let Some(run_id) = req.headers.get(RECURSION_GUARD_HEADER)
        && run_id == ctx.instance_id
    {
        tracing::warn!(
            webhook_id = %req.webhook_id,
            "Rejected self-forwarded request (forwarding loop)"
        );
        return Err(PipelineError::new(
            422,
            "Refusing to ingest a request forwarded by this instance",
        ));
    }

    // 2. Webhook validity.
    if !ctx.registry.is_valid(&req.webhook_id) {
        return Err(PipelineError::with_details(
            404,
            "Webhook not found or expired",
            serde_json::json!({ "id": req.webhook_id }),
        ));
    }

    // 3. IP whitelist.
    if !snapshot.allowed_ips.is_empty() {
        let allowed = req
            .remote_ip
            .is_some_and(|ip| snapshot.allowed_ips.iter().any(|cidr| cidr.contains(ip)));
        if !allowed {
            return Err(PipelineError::new(403, "Client address is not whitelisted"));
        }
    }

    // 4. Authentication.
    if let Err(e) = validate_auth(&snapshot.auth_key, &req.authorization_values, &req.query) {
        let message = match e {
            AuthError::MissingToken => "Authentication required",
            AuthError::InvalidToken | AuthError::AmbiguousAuthorization => e.message(),
        };
        return Err(PipelineError::new(401, message));
    }

    // 5. Size check. Content-Length wins when it parses; the transport's
    // body reader enforces the same cap independently.
    let declared = req
        .headers
        .get("content-length")
        .and_then(|v| v.parse::<u64>().ok());
    let effective_size = declared.unwrap_or(req.body.len() as u64);
    if effective_size > snapshot.max_payload_bytes {
        return Err(PipelineError::new(
            413,
            format!(
                "Payload exceeds the maximum size of {} bytes",
                snapshot.max_payload_bytes
            ),
        ));
    }

    // 6. The raw body stays byte-exact for signature checks and forwarding.
    let raw_body = req.body.clone();
    let content_type = req.headers.get("content-type").cloned();

    // 7. Parse the body when JSON parsing applies; a parse failure keeps
    // the raw string rather than erroring.
    let json_capable = snapshot.enable_json_parsing && is_json_content_type(content_type.as_deref());
    let (body, parsed_json) = if json_capable {
        match serde_json::from_slice::<serde_json::Value>(&raw_body) {
            Ok(value) => (value, true),
            Err(_) => (
                serde_json::Value::String(String::from_utf8_lossy(&raw_body).into_owned()),
                false,
            ),
        }
    } else {
        (
            serde_json::Value::String(String::from_utf8_lossy(&raw_body).into_owned()),
            false,
        )
    };

    // 8. JSON schema validation.
    if parsed_json && let Some(schema) = &snapshot.json_schema {
        let violations = ctx.schemas.validate(schema, &body);
        if !violations.is_empty() {
            return Err(PipelineError::with_details(
                400,
                "Schema validation failed",
                serde_json::json!({ "violations": violations }),
            ));
        }
    }

    // 9. Signature verification: recorded, never a short-circuit.
    let signature = snapshot
        .signature
        .as_ref()
        .map(|cfg| verify_signature(cfg, &raw_body, &req.headers, Utc::now()));
    if let Some(outcome) = &signature
        && !outcome.valid
    {
        tracing::warn!(
            webhook_id = %req.webhook_id,
            provider = %outcome.provider,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Signature verification failed"
        );
    }

    // 10. Build the event.
    let overrides = ctx.registry.get_data(&req.webhook_id);
    let status = effective_status(&req.query, overrides.as_ref(), snapshot);
    let headers_for_event = if snapshot.mask_sensitive_data {
        mask_headers(&req.headers)
    } else {
        req.headers.clone()
    };
    let mut event = EventRecord {
        id: event_id(),
        timestamp: Utc::now(),
        webhook_id: req.webhook_id.clone(),
        method: req.method.clone(),
        headers: headers_for_event,
        query: req.query.clone(),
        body,
        content_type: content_type.clone(),
        size_bytes: effective_size,
        status_code: status,
        response_body: None,
        response_headers: None,
        processing_time_ms: 0,
        remote_ip: req.remote_ip.map(|ip| ip.to_string()),
        user_agent: req.headers.get("user-agent").cloned(),
        request_id: Some(
            req.headers
                .get("x-request-id")
                .cloned()
                .unwrap_or_else(request_id),
        ),
        signature_valid: signature.as_ref().map(|s| s.valid),
        signature_provider: signature.as_ref().map(|s| s.provider.clone()),
        signature_error: signature.and_then(|s| s.error),
    };

    // 11. Script transform.
    if let Some(script) = &snapshot.custom_script {
        event = apply_transform(ctx, script, event).await;
        if !(100..600).contains(&event.status_code) {
            tracing::warn!(
                status = event.status_code,
                "Script set an out-of-range status; restoring configured status"
            );
            event.status_code = status;
        }
    }

    // 12. Response delay, clamped.
    let configured_delay = overrides
        .as_ref()
        .and_then(|o| o.response_delay_ms)
        .unwrap_or(snapshot.response_delay_ms);
    let delay_ms = if configured_delay > SAFE_RESPONSE_DELAY_MAX_MS {
        tracing::warn!(
            configured = configured_delay,
            clamped = SAFE_RESPONSE_DELAY_MAX_MS,
            "Response delay clamped to safe maximum"
        );
        SAFE_RESPONSE_DELAY_MAX_MS
    } else {
        configured_delay
    };

    // 13. Response rendering inputs: headers merge global, then webhook,
    // then event; body prefers the event's, then webhook, then global.
    let mut response_headers = snapshot.default_response_headers.clone();
    if let Some(o) = overrides.as_ref().and_then(|o| o.response_headers.clone()) {
        response_headers.extend(o);
    }
    if let Some(o) = event.response_headers.clone() {
        response_headers.extend(o);
    }

    let response_status = event.status_code;
    let configured_body = event
        .response_body
        .clone()
        .or_else(|| overrides.as_ref().and_then(|o| o.response_body.clone()))
        .unwrap_or_else(|| snapshot.default_response_body.clone());
    let is_empty_ok = match &configured_body {
        serde_json::Value::String(s) => s.is_empty() || s == "OK",
        serde_json::Value::Null => true,
        _ => false,
    };
    let response_body = if response_status >= 400 && is_empty_ok {
        serde_json::json!({
            "message": format!("Webhook responded with status {}", response_status),
            "webhookId": req.webhook_id,
        })
    } else {
        configured_body
    };

    let forward_url = overrides
        .as_ref()
        .and_then(|o| o.forward_url.clone())
        .or_else(|| snapshot.forward_url.clone());
    let forward_headers = overrides
        .as_ref()
        .and_then(|o| o.forward_headers)
        .unwrap_or(snapshot.forward_headers);

    Ok(PipelineOutput {
        event,
        response_status,
        response_headers,
        response_body,
        delay: Duration::from_millis(delay_ms),
        forward_url,
        forward_headers,
        raw_body,
        inbound_headers: req.headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawConfig, normalize};
    use crate::signature::{SignatureConfig, SignatureProvider};
    use crate::store::MemoryKeyValueStore;
    use crate::types::MASKED_SENTINEL;
    use std::sync::Arc;

    struct Fixture {
        registry: WebhookRegistry,
        sandbox: ScriptSandbox,
        schemas: SchemaValidator,
        webhook_id: String,
    }

    impl Fixture {
        async fn new() -> Self {
            let registry = WebhookRegistry::new(Arc::new(MemoryKeyValueStore::new()));
            let webhook_id = registry.generate(1, 1.0).await.unwrap().remove(0);
            Self {
                registry,
                sandbox: ScriptSandbox::new(),
                schemas: SchemaValidator::new(),
                webhook_id,
            }
        }

        fn ctx<'a>(&'a self, snapshot: &'a ConfigSnapshot) -> PipelineContext<'a> {
            PipelineContext {
                snapshot,
                registry: &self.registry,
                sandbox: &self.sandbox,
                schemas: &self.schemas,
                instance_id: "run_test_instance",
                script_timeout: Duration::from_millis(500),
            }
        }

        fn request(&self, body: &str) -> InboundRequest {
            let mut headers = BTreeMap::new();
            headers.insert("content-type".to_string(), "application/json".to_string());
            headers.insert("user-agent".to_string(), "test-agent/1.0".to_string());
            InboundRequest {
                webhook_id: self.webhook_id.clone(),
                method: "POST".to_string(),
                headers,
                authorization_values: vec![],
                query: BTreeMap::new(),
                body: Bytes::from(body.to_string()),
                remote_ip: Some("203.0.113.5".parse().unwrap()),
            }
        }
    }

    fn snapshot(mutate: impl FnOnce(&mut RawConfig)) -> ConfigSnapshot {
        let mut raw = RawConfig::default();
        mutate(&mut raw);
        normalize(&raw)
    }

    #[tokio::test]
    async fn happy_path_builds_event() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});
        let out = run_pipeline(fx.request(r#"{"x":1}"#), &fx.ctx(&snap))
            .await
            .unwrap();

        assert_eq!(out.response_status, 200);
        assert_eq!(out.event.webhook_id, fx.webhook_id);
        assert_eq!(out.event.body["x"], 1);
        assert_eq!(out.event.method, "POST");
        assert_eq!(out.event.size_bytes, 7);
        assert_eq!(out.event.user_agent.as_deref(), Some("test-agent/1.0"));
        assert!(out.event.request_id.as_deref().unwrap().starts_with("req_"));
        assert!(out.event.id.starts_with("evt_"));
        assert_eq!(
            out.response_body,
            serde_json::Value::String("OK".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_webhook_is_404_with_id() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});
        let mut req = fx.request("{}");
        req.webhook_id = "missing12345".to_string();
        let err = run_pipeline(req, &fx.ctx(&snap)).await.unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.details.unwrap()["id"], "missing12345");
    }

    #[tokio::test]
    async fn recursion_guard_rejects_own_instance_only() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});

        let mut req = fx.request("{}");
        req.headers.insert(
            RECURSION_GUARD_HEADER.to_string(),
            "run_test_instance".to_string(),
        );
        let err = run_pipeline(req, &fx.ctx(&snap)).await.unwrap_err();
        assert_eq!(err.status, 422);

        // A different instance's id passes through.
        let mut req = fx.request("{}");
        req.headers.insert(
            RECURSION_GUARD_HEADER.to_string(),
            "run_other_instance".to_string(),
        );
        assert!(run_pipeline(req, &fx.ctx(&snap)).await.is_ok());
    }

    #[tokio::test]
    async fn ip_whitelist_enforced() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.allowed_ips = vec!["10.0.0.0/8".to_string()];
        });
        let err = run_pipeline(fx.request("{}"), &fx.ctx(&snap))
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);

        let snap = snapshot(|raw| {
            raw.allowed_ips = vec!["203.0.113.0/24".to_string()];
        });
        assert!(run_pipeline(fx.request("{}"), &fx.ctx(&snap)).await.is_ok());
    }

    #[tokio::test]
    async fn auth_enforced_when_key_set() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.auth_key = Some(crate::config::ConfigValue::Literal("k".to_string()));
        });

        let err = run_pipeline(fx.request("{}"), &fx.ctx(&snap))
            .await
            .unwrap_err();
        assert_eq!(err.status, 401);
        assert_eq!(err.message, "Authentication required");

        let mut req = fx.request("{}");
        req.authorization_values = vec!["Bearer wrong".to_string()];
        let err = run_pipeline(req, &fx.ctx(&snap)).await.unwrap_err();
        assert_eq!(err.status, 401);
        assert_eq!(err.message, "Invalid authentication token");

        let mut req = fx.request("{}");
        req.authorization_values = vec!["Bearer k".to_string()];
        assert!(run_pipeline(req, &fx.ctx(&snap)).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_payload_is_413_naming_the_limit() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.max_payload_size = Some(1024.0);
        });
        let big = "x".repeat(2048);
        let mut req = fx.request(&big);
        req.headers
            .insert("content-type".to_string(), "text/plain".to_string());
        let err = run_pipeline(req, &fx.ctx(&snap)).await.unwrap_err();
        assert_eq!(err.status, 413);
        assert!(err.message.contains("1024"));
    }

    #[tokio::test]
    async fn content_length_header_wins_when_finite() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.max_payload_size = Some(1024.0);
        });
        let mut req = fx.request("tiny");
        req.headers
            .insert("content-length".to_string(), "999999".to_string());
        let err = run_pipeline(req, &fx.ctx(&snap)).await.unwrap_err();
        assert_eq!(err.status, 413);
    }

    #[tokio::test]
    async fn unparseable_json_body_kept_as_string() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});
        let out = run_pipeline(fx.request("{not json"), &fx.ctx(&snap))
            .await
            .unwrap();
        assert_eq!(
            out.event.body,
            serde_json::Value::String("{not json".to_string())
        );
    }

    #[tokio::test]
    async fn json_parsing_disabled_keeps_raw_string() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.enable_json_parsing = Some(false);
        });
        let out = run_pipeline(fx.request(r#"{"x":1}"#), &fx.ctx(&snap))
            .await
            .unwrap();
        assert_eq!(
            out.event.body,
            serde_json::Value::String(r#"{"x":1}"#.to_string())
        );
    }

    #[tokio::test]
    async fn schema_violations_are_400_with_details() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.json_schema = Some(serde_json::json!({
                "type": "object",
                "required": ["name"]
            }));
        });
        let err = run_pipeline(fx.request(r#"{"other":1}"#), &fx.ctx(&snap))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert!(err.details.is_some());

        // Non-JSON content types skip schema validation.
        let mut req = fx.request("plain text");
        req.headers
            .insert("content-type".to_string(), "text/plain".to_string());
        assert!(run_pipeline(req, &fx.ctx(&snap)).await.is_ok());
    }

    #[tokio::test]
    async fn signature_failure_recorded_not_rejected() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.signature_verification = Some(SignatureConfig {
                provider: SignatureProvider::Github,
                secret: "s".to_string(),
                algorithm: Default::default(),
                encoding: Default::default(),
                prefix: None,
                tolerance_seconds: 300,
                header_name: None,
                timestamp_key: None,
            });
        });
        let out = run_pipeline(fx.request("{}"), &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 200);
        assert_eq!(out.event.signature_valid, Some(false));
        assert_eq!(out.event.signature_provider.as_deref(), Some("github"));
        assert!(out.event.signature_error.is_some());
    }

    #[tokio::test]
    async fn status_query_override_applied_in_range_only() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});

        let mut req = fx.request("{}");
        req.query.insert("__status".to_string(), "418".to_string());
        let out = run_pipeline(req, &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 418);

        let mut req = fx.request("{}");
        req.query.insert("__status".to_string(), "999".to_string());
        let out = run_pipeline(req, &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 200);
    }

    #[tokio::test]
    async fn webhook_overrides_beat_global_defaults() {
        let fx = Fixture::new().await;
        fx.registry
            .set_overrides(
                &fx.webhook_id,
                Some(WebhookOverrides {
                    response_code: Some(202),
                    response_body: Some(serde_json::json!({"queued": true})),
                    response_headers: Some(
                        [("x-custom".to_string(), "1".to_string())].into_iter().collect(),
                    ),
                    forward_url: Some("https://per-hook.example.com".to_string()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let snap = snapshot(|raw| {
            raw.forward_url = Some("https://global.example.com".to_string());
        });
        let out = run_pipeline(fx.request("{}"), &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 202);
        assert_eq!(out.response_body["queued"], true);
        assert_eq!(out.response_headers["x-custom"], "1");
        assert_eq!(
            out.forward_url.as_deref(),
            Some("https://per-hook.example.com")
        );
    }

    #[tokio::test]
    async fn error_status_with_ok_body_gets_json_explanation() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});
        let mut req = fx.request("{}");
        req.query.insert("__status".to_string(), "500".to_string());
        let out = run_pipeline(req, &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 500);
        assert_eq!(out.response_body["webhookId"], fx.webhook_id.as_str());
        assert!(out.response_body["message"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn headers_masked_in_event_when_enabled() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});
        let mut req = fx.request("{}");
        req.headers
            .insert("x-api-key".to_string(), "secret-key".to_string());
        let out = run_pipeline(req, &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.event.headers["x-api-key"], MASKED_SENTINEL);
        // The unmasked copy survives for forwarding.
        assert_eq!(out.inbound_headers["x-api-key"], "secret-key");
    }

    #[tokio::test]
    async fn script_transform_mutates_event() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.custom_script = Some(
                r#"
                event.statusCode = 201;
                event.responseBody = "created";
                "#
                .to_string(),
            );
        });
        let out = run_pipeline(fx.request("{}"), &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 201);
        assert_eq!(
            out.response_body,
            serde_json::Value::String("created".to_string())
        );
    }

    #[tokio::test]
    async fn broken_script_leaves_event_unchanged() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.custom_script = Some("event.undefined_fn();".to_string());
        });
        let out = run_pipeline(fx.request("{}"), &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.response_status, 200);
    }

    #[tokio::test]
    async fn delay_clamped_to_safe_maximum() {
        let fx = Fixture::new().await;
        let snap = snapshot(|raw| {
            raw.response_delay_ms = Some(120_000.0);
        });
        let out = run_pipeline(fx.request("{}"), &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.delay, Duration::from_millis(SAFE_RESPONSE_DELAY_MAX_MS));
    }

    #[tokio::test]
    async fn inbound_request_id_propagated() {
        let fx = Fixture::new().await;
        let snap = snapshot(|_| {});
        let mut req = fx.request("{}");
        req.headers
            .insert("x-request-id".to_string(), "req_inbound_77".to_string());
        let out = run_pipeline(req, &fx.ctx(&snap)).await.unwrap();
        assert_eq!(out.event.request_id.as_deref(), Some("req_inbound_77"));
    }
}
