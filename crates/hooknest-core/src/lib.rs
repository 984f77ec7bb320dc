//! # hooknest-core
//!
//! Core engine for hooknest - a programmable webhook receiver, recorder,
//! and replayer.
//!
//! This crate provides the domain logic for hooknest without any HTTP or
//! CLI concerns. It can be embedded in other Rust applications or used
//! standalone.
//!
//! ## Features
//!
//! - **Ephemeral endpoints**: a TTL-bounded pool of opaque webhook ids
//! - **Ingestion pipeline**: auth, IP whitelist, size caps, signature
//!   verification, schema checks, scripted transforms, mock responses
//! - **Background delivery**: SSRF-gated forwarding with retries, alert
//!   channels, and dataset persistence under a deadline
//! - **Replay**: re-issue any recorded event to an arbitrary target
//! - **Hot reload**: atomic config snapshot swaps without dropping
//!   in-flight requests
//!
//! ## Quick Start
//!
//! ```ignore
//! use hooknest_core::{Hooknest, resolve_config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = resolve_config(None)?;
//!     let hooknest = Hooknest::from_config(config).await?;
//!
//!     let ids = hooknest.generate_webhooks(2, 24.0).await?;
//!     for id in ids {
//!         println!("POST to /webhook/{}", id);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Snapshot model
//!
//! Configuration lives in an immutable [`ConfigSnapshot`] behind an atomic
//! pointer. Each request clones the pointer once at entry and runs the
//! whole pipeline against that value; the hot-reload controller publishes
//! replacements without touching requests already in flight.

pub mod auth;
mod bus;
mod config;
mod error;
pub mod forward;
mod pipeline;
pub mod ratelimit;
mod registry;
mod reload;
mod replay;
mod sandbox;
mod schema;
pub mod security;
pub mod signature;
mod store;
mod types;

pub use bus::{EventBus, Subscription};
pub use config::{
    AlertChannel, AlertsConfig, Config, ConfigSnapshot, ConfigValue, HooknestConfig, RawConfig,
    SAFE_RESPONSE_DELAY_MAX_MS, ServerConfig, normalize, raw_from_json, resolve_config,
};
pub use error::{Error, Result};
pub use pipeline::{
    InboundRequest, PipelineContext, PipelineError, PipelineOutput, RECURSION_GUARD_HEADER,
    run_pipeline,
};
pub use registry::{REGISTRY_KV_KEY, WebhookRegistry};
pub use reload::{CONFIG_KV_KEY, ConfigSource, ReloadController};
pub use replay::{ReplayEngine, ReplayError, ReplayOutcome};
pub use sandbox::{DEFAULT_SCRIPT_TIMEOUT, ScriptSandbox};
pub use schema::{SchemaValidator, SchemaViolation};
pub use store::{
    EventSink, EventStore, FileKeyValueStore, JsonlEventStore, KeyValueStore, LogQuery,
    MemoryEventStore, MemoryKeyValueStore,
};
pub use types::*;

use arc_swap::ArcSwap;
use forward::{BackgroundTask, Forwarder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cadence of the webhook TTL sweep and rate-limiter sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Main entry point for hooknest functionality.
///
/// Wires the registry, config snapshot, event bus, stores, and delivery
/// machinery together. Constructed once at startup and shared behind an
/// `Arc`; there is no package-level mutable state.
pub struct Hooknest {
    server: ServerConfig,
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    registry: Arc<WebhookRegistry>,
    limiter: Arc<ratelimit::RateLimiter>,
    sandbox: Arc<ScriptSandbox>,
    schemas: Arc<SchemaValidator>,
    bus: EventBus,
    kv: Arc<dyn KeyValueStore>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn EventStore>,
    forwarder: Arc<Forwarder>,
    instance_id: String,
    started_at: Instant,
    cancel: CancellationToken,
}

impl Hooknest {
    /// Create a hooknest instance with file-backed stores under the
    /// configured state directory.
    pub async fn from_config(config: HooknestConfig) -> Result<Self> {
        let server = config.server.clone().unwrap_or_default();
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(&server.state_dir)?);
        let dataset = Arc::new(JsonlEventStore::new(server.state_dir.join("events.jsonl"))?);
        let sink: Arc<dyn EventSink> = dataset.clone();
        let store: Arc<dyn EventStore> = dataset;
        Self::with_stores(config, kv, sink, store).await
    }

    /// Create a hooknest instance with explicit collaborator
    /// implementations (used by tests and embedders).
    pub async fn with_stores(
        config: HooknestConfig,
        kv: Arc<dyn KeyValueStore>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        let server = config.server.unwrap_or_default();
        let snapshot = normalize(&config.receiver);

        let sandbox = Arc::new(ScriptSandbox::new());
        if let Some(script) = &snapshot.custom_script
            && let Err(e) = sandbox.prepare(script)
        {
            tracing::warn!(error = %e, "Custom script failed to compile at startup");
        }
        let schemas = Arc::new(SchemaValidator::new());
        if let Some(schema) = &snapshot.json_schema
            && let Err(e) = schemas.prepare(schema)
        {
            tracing::warn!(error = %e, "JSON schema failed to compile at startup");
        }

        let limiter = Arc::new(ratelimit::RateLimiter::new(
            snapshot.rate_limit_per_minute as usize,
            Duration::from_secs(60),
            server.rate_limit_max_entries,
        )?);

        let registry = Arc::new(WebhookRegistry::new(kv.clone()));
        registry.load().await;
        registry
            .scale_up(snapshot.url_count, snapshot.retention_hours)
            .await?;

        let instance_id = format!("run_{}", random_token(12));
        let forwarder = Arc::new(Forwarder::new(instance_id.clone()));

        Ok(Self {
            bus: EventBus::new(server.max_sse_subscribers),
            server,
            snapshot: Arc::new(ArcSwap::from_pointee(snapshot)),
            registry,
            limiter,
            sandbox,
            schemas,
            kv,
            sink,
            store,
            forwarder,
            instance_id,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        })
    }

    /// The config snapshot for a new request. Cheap (one atomic load).
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<ratelimit::RateLimiter> {
        &self.limiter
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Run the ingestion pipeline for one lowered request against the
    /// current snapshot.
    pub async fn handle_request(
        &self,
        request: InboundRequest,
        snapshot: &Arc<ConfigSnapshot>,
    ) -> std::result::Result<PipelineOutput, PipelineError> {
        let ctx = PipelineContext {
            snapshot: snapshot.as_ref(),
            registry: &self.registry,
            sandbox: &self.sandbox,
            schemas: &self.schemas,
            instance_id: &self.instance_id,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        };
        run_pipeline(request, &ctx).await
    }

    /// Publish the event to live subscribers and kick off the background
    /// orchestrator. Returns immediately; the response path never awaits
    /// background work.
    pub fn dispatch_background(
        &self,
        snapshot: Arc<ConfigSnapshot>,
        output: PipelineOutput,
        error_text: Option<String>,
    ) {
        self.bus.emit(Arc::new(output.event.clone()));
        let task = BackgroundTask {
            snapshot,
            output,
            sink: Arc::clone(&self.sink),
            forwarder: Arc::clone(&self.forwarder),
            deadline: Duration::from_millis(self.server.background_deadline_ms),
            error_text,
        };
        tokio::spawn(forward::run_background_tasks(task));
    }

    /// Subscribe to the live event stream, or `None` at the cap.
    pub fn subscribe(&self) -> Option<Subscription> {
        self.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Mint new webhook endpoints.
    pub async fn generate_webhooks(&self, count: usize, retention_hours: f64) -> Result<Vec<String>> {
        self.registry.generate(count, retention_hours).await
    }

    /// Replay a stored event to `target_url` using the current snapshot's
    /// retry budget.
    pub async fn replay(
        &self,
        webhook_id: &str,
        item_id: &str,
        target_url: &str,
    ) -> std::result::Result<ReplayOutcome, ReplayError> {
        let snapshot = self.snapshot();
        let engine = ReplayEngine::new(Arc::clone(&self.forwarder), Arc::clone(&self.store));
        engine
            .replay(
                webhook_id,
                item_id,
                target_url,
                snapshot.replay_max_retries,
                Duration::from_millis(snapshot.replay_timeout_ms),
            )
            .await
    }

    /// Query recorded events (newest first).
    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<EventRecord>> {
        self.store.query(query).await
    }

    /// Start the background machinery: hot-reload polling, the TTL sweep,
    /// and the rate-limiter sweeper.
    pub fn start_background(self: &Arc<Self>, config_source: ConfigSource) {
        let controller = Arc::new(ReloadController::new(
            config_source,
            Arc::clone(&self.kv),
            Arc::clone(&self.snapshot),
            Arc::clone(&self.registry),
            Arc::clone(&self.limiter),
            Arc::clone(&self.sandbox),
            Arc::clone(&self.schemas),
            String::new(),
            Duration::from_millis(self.server.poll_interval_ms),
        ));
        tokio::spawn(Arc::clone(&controller).run(self.cancel.clone()));

        self.limiter.spawn_sweeper(SWEEP_INTERVAL);

        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
        });
    }

    /// Graceful shutdown: cancel tickers, stop the limiter sweeper, and
    /// persist the registry.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.limiter.close();
        self.registry.persist().await;
        tracing::info!("hooknest engine shut down");
    }
}
