//! Hot-reload controller: watches the raw config source, rebuilds the
//! immutable snapshot, and publishes it by atomic pointer swap.
//!
//! In-flight requests keep the snapshot they started with. Only one reload
//! runs at a time; polls that land mid-reload are dropped, not queued.
//! Side-effectful state (rate-limiter limit, webhook pool size, retention)
//! is reconciled after the swap; the body-size cap needs no reconciliation
//! because the transport reads it from the live snapshot per request.

use crate::config::{ConfigSnapshot, HooknestConfig, RawConfig, normalize, raw_from_json};
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;
use crate::registry::WebhookRegistry;
use crate::sandbox::ScriptSandbox;
use crate::schema::SchemaValidator;
use crate::store::KeyValueStore;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// KV key polled for the raw receiver config.
pub const CONFIG_KV_KEY: &str = "receiver-config";

/// Where the raw config comes from.
pub enum ConfigSource {
    /// The key-value collaborator (host platform input).
    KeyValue,
    /// A local TOML file (the `[receiver]` section is the raw config).
    File(PathBuf),
}

pub struct ReloadController {
    source: ConfigSource,
    kv: Arc<dyn KeyValueStore>,
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    registry: Arc<WebhookRegistry>,
    limiter: Arc<RateLimiter>,
    sandbox: Arc<ScriptSandbox>,
    schemas: Arc<SchemaValidator>,
    last_raw: std::sync::Mutex<String>,
    in_progress: AtomicBool,
    poll_interval: Duration,
}

impl ReloadController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: ConfigSource,
        kv: Arc<dyn KeyValueStore>,
        snapshot: Arc<ArcSwap<ConfigSnapshot>>,
        registry: Arc<WebhookRegistry>,
        limiter: Arc<RateLimiter>,
        sandbox: Arc<ScriptSandbox>,
        schemas: Arc<SchemaValidator>,
        initial_raw: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            kv,
            snapshot,
            registry,
            limiter,
            sandbox,
            schemas,
            last_raw: std::sync::Mutex::new(initial_raw.trim().to_string()),
            in_progress: AtomicBool::new(false),
            poll_interval,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup state settles.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Reload controller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
    }

    /// One poll: read, compare, maybe reload. Polls that arrive while a
    /// reload is running are dropped to avoid stampedes.
    pub async fn poll(&self) {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            tracing::debug!("Reload already in progress; dropping poll");
            return;
        }
        if let Err(e) = self.reload_once().await {
            tracing::warn!(error = %e, "Config reload failed; keeping previous snapshot");
        }
        self.in_progress.store(false, Ordering::Release);
    }

    async fn read_raw(&self) -> Result<Option<(String, RawConfig)>> {
        match &self.source {
            ConfigSource::KeyValue => {
                let Some(value) = self.kv.get_value(CONFIG_KV_KEY).await? else {
                    return Ok(None);
                };
                let raw = raw_from_json(&value)?;
                Ok(Some((value.to_string(), raw)))
            }
            ConfigSource::File(path) => {
                let content = match tokio::fs::read_to_string(path).await {
                    Ok(c) => c,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let config: HooknestConfig =
                    toml::from_str(&content).map_err(|e| Error::ConfigParse {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(Some((content, config.receiver)))
            }
        }
    }

    async fn reload_once(&self) -> Result<()> {
        let Some((raw_string, raw)) = self.read_raw().await? else {
            return Ok(());
        };

        // Normalized string compare: identical input is a no-op.
        let trimmed = raw_string.trim();
        {
            let last = self.last_raw.lock().unwrap_or_else(|e| e.into_inner());
            if *last == trimmed {
                return Ok(());
            }
        }

        let previous = self.snapshot.load_full();
        let next = normalize(&raw);

        // Recompile artifacts only when their sources changed. A failed
        // compile clears the artifact and is logged; it never aborts the
        // reload.
        match &next.custom_script {
            Some(script) => {
                if let Err(e) = self.sandbox.prepare(script) {
                    tracing::warn!(error = %e, "Custom script failed to compile during reload");
                }
            }
            None => self.sandbox.clear(),
        }
        match &next.json_schema {
            Some(schema) => {
                if let Err(e) = self.schemas.prepare(schema) {
                    tracing::warn!(error = %e, "JSON schema failed to compile during reload");
                }
            }
            None => self.schemas.clear(),
        }

        let retention_changed = next.retention_hours != previous.retention_hours;
        let url_count = next.url_count;
        let retention_hours = next.retention_hours;
        let rate_limit = next.rate_limit_per_minute;

        // Publish. In-flight requests keep the snapshot they loaded.
        self.snapshot.store(Arc::new(next));
        {
            let mut last = self.last_raw.lock().unwrap_or_else(|e| e.into_inner());
            *last = trimmed.to_string();
        }

        // Reconcile side-effectful state.
        self.limiter.set_limit(rate_limit as usize);
        if let Err(e) = self.registry.scale_up(url_count, retention_hours).await {
            tracing::warn!(error = %e, "Failed to scale webhook pool during reload");
        }
        if retention_changed
            && let Err(e) = self.registry.extend_retention(retention_hours).await
        {
            tracing::warn!(error = %e, "Failed to extend retention during reload");
        }

        tracing::info!(
            url_count,
            rate_limit_per_minute = rate_limit,
            retention_hours,
            "Configuration reload complete"
        );
        Ok(())
    }
}
