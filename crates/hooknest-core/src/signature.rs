//! HMAC signature verification for inbound webhooks.
//!
//! The MAC input is always the raw request body exactly as received, never
//! the parsed form. Digest comparison is constant-time. Verification never
//! short-circuits ingestion: the outcome is recorded on the event and
//! routes that want to reject must consult it explicitly.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

/// Supported webhook providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureProvider {
    Stripe,
    Shopify,
    Github,
    Slack,
    Custom,
}

impl SignatureProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureProvider::Stripe => "stripe",
            SignatureProvider::Shopify => "shopify",
            SignatureProvider::Github => "github",
            SignatureProvider::Slack => "slack",
            SignatureProvider::Custom => "custom",
        }
    }
}

/// HMAC hash function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha1,
    #[default]
    Sha256,
}

/// Digest wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

/// Signature verification configuration (part of the config snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureConfig {
    pub provider: SignatureProvider,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub algorithm: SignatureAlgorithm,
    #[serde(default)]
    pub encoding: SignatureEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default = "default_tolerance_seconds")]
    pub tolerance_seconds: i64,
    /// Header carrying the signature (custom provider).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Header carrying a unix timestamp (custom provider; optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_key: Option<String>,
}

fn default_tolerance_seconds() -> i64 {
    300
}

/// Result of verifying one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureOutcome {
    pub valid: bool,
    pub provider: String,
    pub error: Option<String>,
}

impl SignatureOutcome {
    fn ok(provider: SignatureProvider) -> Self {
        Self {
            valid: true,
            provider: provider.as_str().to_string(),
            error: None,
        }
    }

    fn fail(provider: SignatureProvider, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            provider: provider.as_str().to_string(),
            error: Some(error.into()),
        }
    }
}

/// Verify the signature of a request per the configured provider.
///
/// `headers` must be the lowercased header map; `raw_body` the byte-exact
/// body as received.
pub fn verify_signature(
    config: &SignatureConfig,
    raw_body: &[u8],
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> SignatureOutcome {
    let provider = config.provider;
    if config.secret.is_empty() {
        return SignatureOutcome::fail(provider, "Missing signature secret");
    }
    match provider {
        SignatureProvider::Stripe => verify_stripe(config, raw_body, headers, now),
        SignatureProvider::Shopify => verify_shopify(config, raw_body, headers, now),
        SignatureProvider::Github => verify_github(config, raw_body, headers),
        SignatureProvider::Slack => verify_slack(config, raw_body, headers, now),
        SignatureProvider::Custom => verify_custom(config, raw_body, headers, now),
    }
}

fn verify_stripe(
    config: &SignatureConfig,
    raw_body: &[u8],
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> SignatureOutcome {
    let provider = SignatureProvider::Stripe;
    let Some(header) = headers.get("stripe-signature") else {
        return SignatureOutcome::fail(provider, "Missing signature header");
    };

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => candidates.push(v),
            _ => {}
        }
    }
    let Some(ts) = timestamp else {
        return SignatureOutcome::fail(provider, "Malformed signature header");
    };
    if candidates.is_empty() {
        return SignatureOutcome::fail(provider, "Malformed signature header");
    }
    if (now.timestamp() - ts).abs() > config.tolerance_seconds {
        return SignatureOutcome::fail(provider, "Timestamp outside tolerance");
    }

    let mut message = ts.to_string().into_bytes();
    message.push(b'.');
    message.extend_from_slice(raw_body);
    let expected = hmac_digest(SignatureAlgorithm::Sha256, &config.secret, &message);

    for candidate in candidates {
        if let Some(provided) = decode_signature(candidate, SignatureEncoding::Hex)
            && digests_match(&expected, &provided)
        {
            return SignatureOutcome::ok(provider);
        }
    }
    SignatureOutcome::fail(provider, "Signature mismatch")
}

fn verify_shopify(
    config: &SignatureConfig,
    raw_body: &[u8],
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> SignatureOutcome {
    let provider = SignatureProvider::Shopify;
    let Some(header) = headers.get("x-shopify-hmac-sha256") else {
        return SignatureOutcome::fail(provider, "Missing signature header");
    };

    if let Some(triggered_at) = headers.get("x-shopify-triggered-at") {
        match DateTime::parse_from_rfc3339(triggered_at) {
            Ok(ts) => {
                if (now.timestamp() - ts.timestamp()).abs() > config.tolerance_seconds {
                    return SignatureOutcome::fail(provider, "Timestamp outside tolerance");
                }
            }
            Err(_) => {
                return SignatureOutcome::fail(provider, "Malformed timestamp header");
            }
        }
    }

    let expected = hmac_digest(SignatureAlgorithm::Sha256, &config.secret, raw_body);
    match decode_signature(header, SignatureEncoding::Base64) {
        Some(provided) if digests_match(&expected, &provided) => SignatureOutcome::ok(provider),
        Some(_) => SignatureOutcome::fail(provider, "Signature mismatch"),
        None => SignatureOutcome::fail(provider, "Malformed signature header"),
    }
}

fn verify_github(
    config: &SignatureConfig,
    raw_body: &[u8],
    headers: &BTreeMap<String, String>,
) -> SignatureOutcome {
    let provider = SignatureProvider::Github;
    let Some(header) = headers.get("x-hub-signature-256") else {
        return SignatureOutcome::fail(provider, "Missing signature header");
    };
    let Some(hex_part) = header.strip_prefix("sha256=") else {
        return SignatureOutcome::fail(provider, "Malformed signature header");
    };

    let expected = hmac_digest(SignatureAlgorithm::Sha256, &config.secret, raw_body);
    match decode_signature(hex_part, SignatureEncoding::Hex) {
        Some(provided) if digests_match(&expected, &provided) => SignatureOutcome::ok(provider),
        Some(_) => SignatureOutcome::fail(provider, "Signature mismatch"),
        None => SignatureOutcome::fail(provider, "Malformed signature header"),
    }
}

fn verify_slack(
    config: &SignatureConfig,
    raw_body: &[u8],
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> SignatureOutcome {
    let provider = SignatureProvider::Slack;
    let Some(header) = headers.get("x-slack-signature") else {
        return SignatureOutcome::fail(provider, "Missing signature header");
    };
    let Some(ts_header) = headers.get("x-slack-request-timestamp") else {
        return SignatureOutcome::fail(provider, "Missing timestamp header");
    };
    let Ok(ts) = ts_header.parse::<i64>() else {
        return SignatureOutcome::fail(provider, "Malformed timestamp header");
    };
    if (now.timestamp() - ts).abs() > config.tolerance_seconds {
        return SignatureOutcome::fail(provider, "Timestamp outside tolerance");
    }
    let Some(hex_part) = header.strip_prefix("v0=") else {
        return SignatureOutcome::fail(provider, "Malformed signature header");
    };

    let mut message = format!("v0:{}:", ts).into_bytes();
    message.extend_from_slice(raw_body);
    let expected = hmac_digest(SignatureAlgorithm::Sha256, &config.secret, &message);
    match decode_signature(hex_part, SignatureEncoding::Hex) {
        Some(provided) if digests_match(&expected, &provided) => SignatureOutcome::ok(provider),
        Some(_) => SignatureOutcome::fail(provider, "Signature mismatch"),
        None => SignatureOutcome::fail(provider, "Malformed signature header"),
    }
}

fn verify_custom(
    config: &SignatureConfig,
    raw_body: &[u8],
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> SignatureOutcome {
    let provider = SignatureProvider::Custom;
    let Some(header_name) = config.header_name.as_deref() else {
        return SignatureOutcome::fail(provider, "Missing signature header name in config");
    };
    let Some(header) = headers.get(&header_name.to_ascii_lowercase()) else {
        return SignatureOutcome::fail(provider, "Missing signature header");
    };

    if let Some(ts_key) = config.timestamp_key.as_deref()
        && let Some(ts_header) = headers.get(&ts_key.to_ascii_lowercase())
    {
        let Ok(ts) = ts_header.parse::<i64>() else {
            return SignatureOutcome::fail(provider, "Malformed timestamp header");
        };
        if (now.timestamp() - ts).abs() > config.tolerance_seconds {
            return SignatureOutcome::fail(provider, "Timestamp outside tolerance");
        }
    }

    let value = match config.prefix.as_deref() {
        Some(prefix) => match header.strip_prefix(prefix) {
            Some(rest) => rest,
            None => return SignatureOutcome::fail(provider, "Malformed signature header"),
        },
        None => header.as_str(),
    };

    let expected = hmac_digest(config.algorithm, &config.secret, raw_body);
    match decode_signature(value, config.encoding) {
        Some(provided) if digests_match(&expected, &provided) => SignatureOutcome::ok(provider),
        Some(_) => SignatureOutcome::fail(provider, "Signature mismatch"),
        None => SignatureOutcome::fail(provider, "Malformed signature header"),
    }
}

fn hmac_digest(algorithm: SignatureAlgorithm, secret: &str, message: &[u8]) -> Vec<u8> {
    match algorithm {
        SignatureAlgorithm::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        SignatureAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn decode_signature(value: &str, encoding: SignatureEncoding) -> Option<Vec<u8>> {
    match encoding {
        SignatureEncoding::Hex => hex::decode(value.trim()).ok(),
        SignatureEncoding::Base64 => BASE64.decode(value.trim()).ok(),
    }
}

/// Constant-time digest comparison. Both sides are hashed to a fixed width
/// first so unequal lengths cannot leak timing.
fn digests_match(expected: &[u8], provided: &[u8]) -> bool {
    let a = Sha256::digest(expected);
    let b = Sha256::digest(provided);
    a.ct_eq(&b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config(provider: SignatureProvider) -> SignatureConfig {
        SignatureConfig {
            provider,
            secret: "whsec_test".to_string(),
            algorithm: SignatureAlgorithm::default(),
            encoding: SignatureEncoding::default(),
            prefix: None,
            tolerance_seconds: 300,
            header_name: None,
            timestamp_key: None,
        }
    }

    fn hex_hmac_sha256(secret: &str, message: &[u8]) -> String {
        hex::encode(hmac_digest(SignatureAlgorithm::Sha256, secret, message))
    }

    #[test]
    fn stripe_valid_signature() {
        let cfg = config(SignatureProvider::Stripe);
        let now = Utc::now();
        let body = b"{\"id\":\"evt_1\"}";
        let ts = now.timestamp();
        let mut message = ts.to_string().into_bytes();
        message.push(b'.');
        message.extend_from_slice(body);
        let sig = hex_hmac_sha256(&cfg.secret, &message);

        let hdrs = headers(&[("stripe-signature", &format!("t={},v1={}", ts, sig))]);
        let outcome = verify_signature(&cfg, body, &hdrs, now);
        assert!(outcome.valid, "{:?}", outcome);
        assert_eq!(outcome.provider, "stripe");
    }

    #[test]
    fn stripe_stale_timestamp_rejected() {
        let cfg = config(SignatureProvider::Stripe);
        let now = Utc::now();
        let body = b"x";
        let ts = now.timestamp() - 400;
        let mut message = ts.to_string().into_bytes();
        message.push(b'.');
        message.extend_from_slice(body);
        let sig = hex_hmac_sha256(&cfg.secret, &message);

        let hdrs = headers(&[("stripe-signature", &format!("t={},v1={}", ts, sig))]);
        let outcome = verify_signature(&cfg, body, &hdrs, now);
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Timestamp outside tolerance"));
    }

    #[test]
    fn stripe_malformed_header() {
        let cfg = config(SignatureProvider::Stripe);
        let hdrs = headers(&[("stripe-signature", "nonsense")]);
        let outcome = verify_signature(&cfg, b"x", &hdrs, Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Malformed signature header"));
    }

    #[test]
    fn shopify_valid_signature() {
        let cfg = config(SignatureProvider::Shopify);
        let body = b"{\"order\":42}";
        let sig = BASE64.encode(hmac_digest(SignatureAlgorithm::Sha256, &cfg.secret, body));
        let hdrs = headers(&[("x-shopify-hmac-sha256", &sig)]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(outcome.valid, "{:?}", outcome);
    }

    #[test]
    fn shopify_mismatch_reports_error() {
        let cfg = config(SignatureProvider::Shopify);
        let body = b"{\"order\":42}";
        let sig = BASE64.encode(hmac_digest(SignatureAlgorithm::Sha256, &cfg.secret, b"other"));
        let hdrs = headers(&[("x-shopify-hmac-sha256", &sig)]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Signature mismatch"));
    }

    #[test]
    fn shopify_timestamp_enforced_when_present() {
        let cfg = config(SignatureProvider::Shopify);
        let body = b"{}";
        let sig = BASE64.encode(hmac_digest(SignatureAlgorithm::Sha256, &cfg.secret, body));
        let stale = (Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339();
        let hdrs = headers(&[
            ("x-shopify-hmac-sha256", sig.as_str()),
            ("x-shopify-triggered-at", stale.as_str()),
        ]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Timestamp outside tolerance"));
    }

    #[test]
    fn github_valid_signature() {
        let cfg = config(SignatureProvider::Github);
        let body = b"{\"action\":\"opened\"}";
        let sig = format!("sha256={}", hex_hmac_sha256(&cfg.secret, body));
        let hdrs = headers(&[("x-hub-signature-256", &sig)]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(outcome.valid, "{:?}", outcome);
    }

    #[test]
    fn github_missing_header() {
        let cfg = config(SignatureProvider::Github);
        let outcome = verify_signature(&cfg, b"x", &BTreeMap::new(), Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Missing signature header"));
    }

    #[test]
    fn slack_valid_signature() {
        let cfg = config(SignatureProvider::Slack);
        let now = Utc::now();
        let ts = now.timestamp();
        let body = b"payload=%7B%7D";
        let mut message = format!("v0:{}:", ts).into_bytes();
        message.extend_from_slice(body);
        let sig = format!("v0={}", hex_hmac_sha256(&cfg.secret, &message));
        let hdrs = headers(&[
            ("x-slack-signature", sig.as_str()),
            ("x-slack-request-timestamp", &ts.to_string()),
        ]);
        let outcome = verify_signature(&cfg, body, &hdrs, now);
        assert!(outcome.valid, "{:?}", outcome);
    }

    #[test]
    fn slack_requires_timestamp_header() {
        let cfg = config(SignatureProvider::Slack);
        let hdrs = headers(&[("x-slack-signature", "v0=abcd")]);
        let outcome = verify_signature(&cfg, b"x", &hdrs, Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Missing timestamp header"));
    }

    #[test]
    fn custom_provider_with_prefix_and_sha1() {
        let mut cfg = config(SignatureProvider::Custom);
        cfg.algorithm = SignatureAlgorithm::Sha1;
        cfg.header_name = Some("X-My-Signature".to_string());
        cfg.prefix = Some("sig=".to_string());
        let body = b"hello";
        let sig = format!(
            "sig={}",
            hex::encode(hmac_digest(SignatureAlgorithm::Sha1, &cfg.secret, body))
        );
        let hdrs = headers(&[("x-my-signature", &sig)]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(outcome.valid, "{:?}", outcome);
    }

    #[test]
    fn custom_provider_base64_encoding() {
        let mut cfg = config(SignatureProvider::Custom);
        cfg.encoding = SignatureEncoding::Base64;
        cfg.header_name = Some("x-sig".to_string());
        let body = b"hello";
        let sig = BASE64.encode(hmac_digest(SignatureAlgorithm::Sha256, &cfg.secret, body));
        let hdrs = headers(&[("x-sig", &sig)]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(outcome.valid, "{:?}", outcome);
    }

    #[test]
    fn custom_provider_timestamp_tolerance() {
        let mut cfg = config(SignatureProvider::Custom);
        cfg.header_name = Some("x-sig".to_string());
        cfg.timestamp_key = Some("x-ts".to_string());
        let body = b"hello";
        let sig = hex_hmac_sha256(&cfg.secret, body);
        let stale = (Utc::now().timestamp() - 1000).to_string();
        let hdrs = headers(&[("x-sig", sig.as_str()), ("x-ts", stale.as_str())]);
        let outcome = verify_signature(&cfg, body, &hdrs, Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Timestamp outside tolerance"));
    }

    #[test]
    fn empty_secret_fails_closed() {
        let mut cfg = config(SignatureProvider::Github);
        cfg.secret = String::new();
        let outcome = verify_signature(&cfg, b"x", &BTreeMap::new(), Utc::now());
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Missing signature secret"));
    }

    #[test]
    fn signature_config_deserializes_camel_case() {
        let json = r#"{
            "provider": "custom",
            "secret": "s",
            "algorithm": "sha1",
            "encoding": "base64",
            "headerName": "X-Sig",
            "timestampKey": "X-Ts",
            "toleranceSeconds": 60
        }"#;
        let cfg: SignatureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.provider, SignatureProvider::Custom);
        assert_eq!(cfg.algorithm, SignatureAlgorithm::Sha1);
        assert_eq!(cfg.encoding, SignatureEncoding::Base64);
        assert_eq!(cfg.header_name.as_deref(), Some("X-Sig"));
        assert_eq!(cfg.tolerance_seconds, 60);
    }
}
