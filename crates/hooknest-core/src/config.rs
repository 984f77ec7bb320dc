//! Configuration parsing, resolution, and snapshot normalization.
//!
//! Two layers: the on-disk `HooknestConfig` (server bind options plus the
//! `[receiver]` section) and the immutable [`ConfigSnapshot`] the request
//! path runs against. The receiver section is also what the hot-reload
//! controller re-reads from the key-value collaborator, so it deserializes
//! tolerantly: unknown fields are ignored, numbers are floored, and bounds
//! are clamped during normalization.

use crate::error::{Error, Result};
use crate::security::Cidr;
use crate::signature::SignatureConfig;
use crate::types::AlertTrigger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default payload cap: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Hard payload ceiling: 100 MiB. Config cannot raise the cap past this.
pub const HARD_MAX_PAYLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Largest honored response delay; larger configured values are clamped.
pub const SAFE_RESPONSE_DELAY_MAX_MS: u64 = 10_000;

/// Ceiling for configured replay retries.
pub const MAX_REPLAY_RETRIES: u32 = 10;

/// Full configuration file for hooknest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooknestConfig {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub receiver: RawConfig,
}

/// Server bind and runtime options. Not hot-reloadable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Trust `X-Forwarded-For` / `X-Real-IP` for client identity.
    pub behind_proxy: bool,
    /// Directory for the file-backed stores (registry state, dataset).
    pub state_dir: PathBuf,
    pub cors_origins: Vec<String>,
    /// Deadline for post-response background work.
    pub background_deadline_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Hot-reload poll cadence.
    pub poll_interval_ms: u64,
    pub max_sse_subscribers: usize,
    pub rate_limit_max_entries: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            behind_proxy: false,
            state_dir: PathBuf::from("hooknest-state"),
            cors_origins: vec![],
            background_deadline_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            poll_interval_ms: 5_000,
            max_sse_subscribers: 100,
            rate_limit_max_entries: 1000,
        }
    }
}

/// A config value that can be a literal or an `env:VAR` reference.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
}

impl ConfigValue {
    /// Resolve the value, reading from the environment when it starts with
    /// `env:`.
    pub fn resolve(&self) -> Result<String> {
        match self {
            ConfigValue::Literal(s) => {
                if let Some(var_name) = s.strip_prefix("env:") {
                    std::env::var(var_name).map_err(|_| {
                        Error::Config(format!("Environment variable {} not set", var_name))
                    })
                } else {
                    Ok(s.clone())
                }
            }
        }
    }
}

/// Alert channel configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertChannel {
    #[serde(alias = "webhook_url")]
    pub webhook_url: String,
}

/// Alerting destinations.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub slack: Option<AlertChannel>,
    #[serde(default)]
    pub discord: Option<AlertChannel>,
}

impl AlertsConfig {
    pub fn is_empty(&self) -> bool {
        self.slack.is_none() && self.discord.is_none()
    }
}

/// The raw, tolerant receiver configuration as read from the config file
/// or the key-value collaborator. Numbers are deserialized as floats so
/// fractional input survives to the normalizer, which floors them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawConfig {
    #[serde(alias = "url_count")]
    pub url_count: Option<f64>,
    #[serde(alias = "retention_hours")]
    pub retention_hours: Option<f64>,
    #[serde(alias = "auth_key")]
    pub auth_key: Option<ConfigValue>,
    #[serde(alias = "allowed_ips")]
    pub allowed_ips: Vec<String>,
    #[serde(alias = "rate_limit_per_minute")]
    pub rate_limit_per_minute: Option<f64>,
    #[serde(alias = "max_payload_size")]
    pub max_payload_size: Option<f64>,
    #[serde(alias = "enable_json_parsing")]
    pub enable_json_parsing: Option<bool>,
    #[serde(alias = "default_response_code")]
    pub default_response_code: Option<f64>,
    #[serde(alias = "default_response_body")]
    pub default_response_body: Option<serde_json::Value>,
    #[serde(alias = "default_response_headers")]
    pub default_response_headers: BTreeMap<String, String>,
    #[serde(alias = "response_delay_ms")]
    pub response_delay_ms: Option<f64>,
    #[serde(alias = "forward_url")]
    pub forward_url: Option<String>,
    #[serde(alias = "forward_headers")]
    pub forward_headers: Option<bool>,
    #[serde(alias = "json_schema")]
    pub json_schema: Option<serde_json::Value>,
    #[serde(alias = "custom_script")]
    pub custom_script: Option<String>,
    #[serde(alias = "mask_sensitive_data")]
    pub mask_sensitive_data: Option<bool>,
    #[serde(alias = "signature_verification")]
    pub signature_verification: Option<SignatureConfig>,
    pub alerts: Option<AlertsConfig>,
    #[serde(alias = "alert_on")]
    pub alert_on: Vec<String>,
    #[serde(alias = "replay_max_retries")]
    pub replay_max_retries: Option<f64>,
    #[serde(alias = "replay_timeout_ms")]
    pub replay_timeout_ms: Option<f64>,
}

/// The immutable configuration value a request executes against.
///
/// Produced by [`normalize`]; published by atomic pointer swap. Never
/// mutated in place once published.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub auth_key: String,
    pub allowed_ips: Vec<Cidr>,
    pub max_payload_bytes: u64,
    pub enable_json_parsing: bool,
    pub default_response_code: u16,
    pub default_response_body: serde_json::Value,
    pub default_response_headers: BTreeMap<String, String>,
    pub response_delay_ms: u64,
    pub forward_url: Option<String>,
    pub forward_headers: bool,
    pub json_schema: Option<serde_json::Value>,
    pub custom_script: Option<String>,
    pub signature: Option<SignatureConfig>,
    pub alerts: Option<AlertsConfig>,
    pub alert_on: Vec<AlertTrigger>,
    pub rate_limit_per_minute: u32,
    pub url_count: usize,
    pub retention_hours: f64,
    pub replay_max_retries: u32,
    pub replay_timeout_ms: u64,
    pub mask_sensitive_data: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        normalize(&RawConfig::default())
    }
}

fn floor_clamped(value: Option<f64>, default: u64, min: u64, max: u64) -> u64 {
    let v = match value {
        Some(v) if v.is_finite() => v.floor(),
        _ => return default.clamp(min, max),
    };
    if v < min as f64 {
        min
    } else if v > max as f64 {
        max
    } else {
        v as u64
    }
}

fn parse_alert_triggers(raw: &[String]) -> Vec<AlertTrigger> {
    let mut triggers = Vec::new();
    for entry in raw {
        match serde_json::from_value::<AlertTrigger>(serde_json::Value::String(entry.clone())) {
            Ok(t) => {
                if !triggers.contains(&t) {
                    triggers.push(t);
                }
            }
            Err(_) => tracing::warn!(trigger = %entry, "Ignoring unknown alert trigger"),
        }
    }
    triggers
}

fn parse_allowed_ips(raw: &[String]) -> Vec<Cidr> {
    let mut cidrs = Vec::new();
    for entry in raw {
        match entry.parse::<Cidr>() {
            Ok(cidr) => cidrs.push(cidr),
            Err(e) => tracing::warn!(entry = %entry, error = %e, "Ignoring invalid allowed IP entry"),
        }
    }
    cidrs
}

/// Coerce a raw config into an immutable snapshot: integers floored,
/// bounds clamped, secrets resolved, invalid list entries dropped with a
/// warning. Deterministic for identical raw input.
pub fn normalize(raw: &RawConfig) -> ConfigSnapshot {
    let auth_key = match raw.auth_key.as_ref().map(ConfigValue::resolve) {
        Some(Ok(key)) => key,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Failed to resolve auth key; authentication disabled");
            String::new()
        }
        None => String::new(),
    };

    let signature = raw.signature_verification.clone().map(|mut cfg| {
        if let Some(var) = cfg.secret.strip_prefix("env:") {
            match std::env::var(var) {
                Ok(secret) => cfg.secret = secret,
                Err(_) => {
                    tracing::warn!(var, "Signature secret env var not set; verification will fail");
                    cfg.secret = String::new();
                }
            }
        }
        if cfg.tolerance_seconds <= 0 {
            cfg.tolerance_seconds = 300;
        }
        cfg
    });

    let default_response_code = floor_clamped(raw.default_response_code, 200, 100, 599) as u16;

    ConfigSnapshot {
        auth_key,
        allowed_ips: parse_allowed_ips(&raw.allowed_ips),
        max_payload_bytes: floor_clamped(
            raw.max_payload_size,
            DEFAULT_MAX_PAYLOAD_BYTES,
            1,
            HARD_MAX_PAYLOAD_BYTES,
        ),
        enable_json_parsing: raw.enable_json_parsing.unwrap_or(true),
        default_response_code,
        default_response_body: raw
            .default_response_body
            .clone()
            .unwrap_or_else(|| serde_json::Value::String("OK".to_string())),
        default_response_headers: raw.default_response_headers.clone(),
        response_delay_ms: floor_clamped(raw.response_delay_ms, 0, 0, u64::MAX),
        forward_url: raw
            .forward_url
            .clone()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty()),
        forward_headers: raw.forward_headers.unwrap_or(false),
        json_schema: raw.json_schema.clone(),
        custom_script: raw
            .custom_script
            .clone()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        signature,
        alerts: raw.alerts.clone().filter(|a| !a.is_empty()),
        alert_on: parse_alert_triggers(&raw.alert_on),
        rate_limit_per_minute: floor_clamped(raw.rate_limit_per_minute, 60, 0, 1_000_000) as u32,
        url_count: floor_clamped(raw.url_count, 1, 0, 10_000) as usize,
        retention_hours: match raw.retention_hours {
            Some(h) if h.is_finite() && h > 0.0 => h,
            _ => 24.0,
        },
        replay_max_retries: floor_clamped(
            raw.replay_max_retries,
            3,
            0,
            MAX_REPLAY_RETRIES as u64,
        ) as u32,
        replay_timeout_ms: floor_clamped(raw.replay_timeout_ms, 10_000, 100, 60_000),
        mask_sensitive_data: raw.mask_sensitive_data.unwrap_or(true),
    }
}

/// Parse the raw receiver config out of a key-value document (JSON).
pub fn raw_from_json(value: &serde_json::Value) -> Result<RawConfig> {
    Ok(serde_json::from_value(value.clone())?)
}

/// Wrapper for loading config from a file.
pub struct Config;

impl Config {
    /// Load config from a specific path.
    pub fn from_path(path: &Path) -> Result<HooknestConfig> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Resolve config file path using the resolution order:
/// 1. Explicit path if provided
/// 2. HOOKNEST_CONFIG env var
/// 3. hooknest.toml in current directory
/// 4. Walk up ancestors looking for hooknest.toml
/// 5. ~/.config/hooknest/config.toml (user default)
/// 6. /etc/hooknest/config.toml (system default)
pub fn resolve_config(explicit_path: Option<&Path>) -> Result<HooknestConfig> {
    let mut searched = Vec::new();

    // 1. Explicit path
    if let Some(path) = explicit_path {
        if path.exists() {
            return Config::from_path(path);
        }
        searched.push(path.to_path_buf());
    }

    // 2. HOOKNEST_CONFIG env var
    if let Ok(env_path) = std::env::var("HOOKNEST_CONFIG") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Config::from_path(&path);
        }
        searched.push(path);
    }

    // 3 & 4. Current directory and ancestors
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            let config_path = d.join("hooknest.toml");
            if config_path.exists() {
                return Config::from_path(&config_path);
            }
            searched.push(config_path);
            dir = d.parent();
        }
    }

    // 5. User default (~/.config/hooknest/config.toml)
    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("hooknest").join("config.toml");
        if user_config.exists() {
            return Config::from_path(&user_config);
        }
        searched.push(user_config);
    }

    // 6. System default (/etc/hooknest/config.toml)
    let system_config = PathBuf::from("/etc/hooknest/config.toml");
    if system_config.exists() {
        return Config::from_path(&system_config);
    }
    searched.push(system_config);

    Err(Error::ConfigNotFound { searched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureProvider;

    #[test]
    fn test_config_value_literal() {
        let val = ConfigValue::Literal("test".to_string());
        assert_eq!(val.resolve().unwrap(), "test");
    }

    #[test]
    fn test_config_value_env() {
        // SAFETY: the variable name is unique to this test
        unsafe {
            std::env::set_var("TEST_HOOKNEST_VAR", "from_env");
        }
        let val = ConfigValue::Literal("env:TEST_HOOKNEST_VAR".to_string());
        assert_eq!(val.resolve().unwrap(), "from_env");
        unsafe {
            std::env::remove_var("TEST_HOOKNEST_VAR");
        }
    }

    #[test]
    fn test_config_value_env_missing() {
        let val = ConfigValue::Literal("env:NONEXISTENT_HOOKNEST_VAR_12345".to_string());
        assert!(val.resolve().is_err());
    }

    #[test]
    fn test_defaults_applied() {
        let snapshot = normalize(&RawConfig::default());
        assert_eq!(snapshot.auth_key, "");
        assert_eq!(snapshot.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert!(snapshot.enable_json_parsing);
        assert_eq!(snapshot.default_response_code, 200);
        assert_eq!(
            snapshot.default_response_body,
            serde_json::Value::String("OK".to_string())
        );
        assert_eq!(snapshot.rate_limit_per_minute, 60);
        assert_eq!(snapshot.url_count, 1);
        assert_eq!(snapshot.retention_hours, 24.0);
        assert_eq!(snapshot.replay_max_retries, 3);
        assert_eq!(snapshot.replay_timeout_ms, 10_000);
        assert!(snapshot.mask_sensitive_data);
        assert!(snapshot.forward_url.is_none());
    }

    #[test]
    fn test_numbers_floored_and_clamped() {
        let raw = RawConfig {
            url_count: Some(3.9),
            rate_limit_per_minute: Some(10.5),
            max_payload_size: Some(1e12),
            replay_max_retries: Some(99.0),
            replay_timeout_ms: Some(1.0),
            default_response_code: Some(9999.0),
            ..Default::default()
        };
        let snapshot = normalize(&raw);
        assert_eq!(snapshot.url_count, 3);
        assert_eq!(snapshot.rate_limit_per_minute, 10);
        assert_eq!(snapshot.max_payload_bytes, HARD_MAX_PAYLOAD_BYTES);
        assert_eq!(snapshot.replay_max_retries, MAX_REPLAY_RETRIES);
        assert_eq!(snapshot.replay_timeout_ms, 100);
        assert_eq!(snapshot.default_response_code, 599);
    }

    #[test]
    fn test_invalid_list_entries_dropped() {
        let raw = RawConfig {
            allowed_ips: vec![
                "10.0.0.0/8".to_string(),
                "not-a-cidr".to_string(),
                "192.168.1.1".to_string(),
            ],
            alert_on: vec![
                "error".to_string(),
                "4xx".to_string(),
                "sometimes".to_string(),
            ],
            ..Default::default()
        };
        let snapshot = normalize(&raw);
        assert_eq!(snapshot.allowed_ips.len(), 2);
        assert_eq!(
            snapshot.alert_on,
            vec![AlertTrigger::Error, AlertTrigger::ClientError]
        );
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let raw = RawConfig {
            url_count: Some(2.0),
            auth_key: Some(ConfigValue::Literal("k".to_string())),
            allowed_ips: vec!["10.0.0.0/8".to_string()],
            alert_on: vec!["5xx".to_string()],
            ..Default::default()
        };
        assert_eq!(normalize(&raw), normalize(&raw));
    }

    #[test]
    fn test_raw_config_accepts_camel_and_snake_case() {
        let camel: RawConfig = serde_json::from_str(
            r#"{"urlCount": 3, "retentionHours": 2, "maxPayloadSize": 1024, "unknownField": true}"#,
        )
        .unwrap();
        assert_eq!(camel.url_count, Some(3.0));
        assert_eq!(camel.max_payload_size, Some(1024.0));

        let snake: RawConfig = serde_json::from_str(
            r#"{"url_count": 3, "retention_hours": 2, "max_payload_size": 1024}"#,
        )
        .unwrap();
        assert_eq!(snake, camel);
    }

    #[test]
    fn test_parse_full_toml_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 3000
behind_proxy = true
state_dir = "/var/lib/hooknest"

[receiver]
url_count = 3
retention_hours = 48
auth_key = "sekrit"
allowed_ips = ["203.0.113.0/24"]
rate_limit_per_minute = 120
max_payload_size = 1048576
forward_url = "https://upstream.example.com/hook"
forward_headers = true
alert_on = ["error", "5xx"]

[receiver.signature_verification]
provider = "shopify"
secret = "shpss_test"

[receiver.alerts.slack]
webhook_url = "https://hooks.slack.com/services/T/B/x"
"#;
        let config: HooknestConfig = toml::from_str(toml).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 3000);
        assert!(server.behind_proxy);

        let snapshot = normalize(&config.receiver);
        assert_eq!(snapshot.url_count, 3);
        assert_eq!(snapshot.auth_key, "sekrit");
        assert_eq!(snapshot.rate_limit_per_minute, 120);
        assert!(snapshot.forward_headers);
        assert_eq!(
            snapshot.forward_url.as_deref(),
            Some("https://upstream.example.com/hook")
        );
        let sig = snapshot.signature.unwrap();
        assert_eq!(sig.provider, SignatureProvider::Shopify);
        assert!(snapshot.alerts.unwrap().slack.is_some());
        assert_eq!(snapshot.alert_on.len(), 2);
    }

    #[test]
    fn test_raw_from_json_tolerates_unknown_fields() {
        let value = serde_json::json!({
            "authKey": "k",
            "responseDelayMs": 250,
            "somethingNewer": {"nested": true}
        });
        let raw = raw_from_json(&value).unwrap();
        assert_eq!(raw.response_delay_ms, Some(250.0));
        let snapshot = normalize(&raw);
        assert_eq!(snapshot.auth_key, "k");
        assert_eq!(snapshot.response_delay_ms, 250);
    }

    #[test]
    fn test_empty_forward_url_treated_as_none() {
        let raw = RawConfig {
            forward_url: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(normalize(&raw).forward_url.is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("hooknest.toml");
        std::fs::write(
            &config_path,
            r#"
[receiver]
url_count = 2
"#,
        )
        .unwrap();

        let config = Config::from_path(&config_path).unwrap();
        assert_eq!(config.receiver.url_count, Some(2.0));
        assert!(config.server.is_none());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid toml {{{").unwrap();
        assert!(Config::from_path(&config_path).is_err());
    }
}
