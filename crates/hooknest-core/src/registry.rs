//! Webhook endpoint registry: generate, validate, extend, sweep.
//!
//! All mutation goes through one mutex; the TTL sweep is the only
//! destructor. Retention only ever extends. Persistence to the key-value
//! collaborator is best-effort: failures are logged, never surfaced.

use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use crate::types::{WebhookOverrides, WebhookRecord, random_token};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// KV key under which the registry is persisted.
pub const REGISTRY_KV_KEY: &str = "webhook-registry";

/// Length of generated webhook ids.
const WEBHOOK_ID_LEN: usize = 12;

fn retention_to_duration(hours: f64) -> Result<ChronoDuration> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "retention hours must be a positive finite number, got {}",
            hours
        )));
    }
    Ok(ChronoDuration::milliseconds((hours * 3_600_000.0) as i64))
}

/// Registry of provisioned webhook endpoints.
pub struct WebhookRegistry {
    records: Mutex<HashMap<String, WebhookRecord>>,
    kv: Arc<dyn KeyValueStore>,
}

impl WebhookRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            kv,
        }
    }

    /// Restore persisted state from the key-value collaborator. Missing or
    /// unreadable state starts empty (logged, not fatal).
    pub async fn load(&self) {
        match self.kv.get_value(REGISTRY_KV_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<HashMap<String, WebhookRecord>>(value)
            {
                Ok(stored) => {
                    let count = stored.len();
                    *self.records.lock().unwrap_or_else(|e| e.into_inner()) = stored;
                    tracing::info!(count, "Restored webhook registry");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Persisted webhook registry is unreadable; starting empty");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read persisted webhook registry; starting empty");
            }
        }
    }

    /// Create `count` fresh webhook records expiring `retention_hours` from
    /// now. Returns the new ids. Persists best-effort.
    pub async fn generate(&self, count: usize, retention_hours: f64) -> Result<Vec<String>> {
        let retention = retention_to_duration(retention_hours)?;
        let expires_at = Utc::now() + retention;

        let ids = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                let id = loop {
                    let candidate = random_token(WEBHOOK_ID_LEN);
                    if !records.contains_key(&candidate) {
                        break candidate;
                    }
                };
                records.insert(
                    id.clone(),
                    WebhookRecord {
                        expires_at,
                        overrides: None,
                    },
                );
                ids.push(id);
            }
            ids
        };

        if !ids.is_empty() {
            self.persist().await;
        }
        Ok(ids)
    }

    /// Valid iff present and unexpired.
    pub fn is_valid(&self, id: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(id)
            .is_some_and(|r| !r.is_expired(Utc::now()))
    }

    /// Per-webhook overrides, if any are set.
    pub fn get_data(&self, id: &str) -> Option<WebhookOverrides> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(id).and_then(|r| r.overrides.clone())
    }

    /// Replace the override bag for an existing webhook.
    pub async fn set_overrides(&self, id: &str, overrides: Option<WebhookOverrides>) -> Result<()> {
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let record = records
                .get_mut(id)
                .ok_or_else(|| Error::WebhookNotFound(id.to_string()))?;
            record.overrides = overrides.filter(|o| !o.is_empty());
        }
        self.persist().await;
        Ok(())
    }

    /// Extend every record so it lives at least `hours` from now.
    /// Retention is monotone: expirations never move backwards.
    pub async fn extend_retention(&self, hours: f64) -> Result<()> {
        let retention = retention_to_duration(hours)?;
        let floor = Utc::now() + retention;
        let changed = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let mut changed = false;
            for record in records.values_mut() {
                if record.expires_at < floor {
                    record.expires_at = floor;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.persist().await;
        }
        Ok(())
    }

    /// Grow the pool to at least `target` live webhooks. Scale-down is
    /// deliberately not a thing: existing records are never removed here.
    pub async fn scale_up(&self, target: usize, retention_hours: f64) -> Result<Vec<String>> {
        let live = self.list().len();
        if live >= target {
            return Ok(Vec::new());
        }
        let ids = self.generate(target - live, retention_hours).await?;
        tracing::info!(added = ids.len(), target, "Scaled webhook pool up");
        Ok(ids)
    }

    /// Remove expired records. Persists only when something was removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let before = records.len();
            records.retain(|_, r| !r.is_expired(now));
            before - records.len()
        };
        if removed > 0 {
            tracing::info!(removed, "Swept expired webhooks");
            self.persist().await;
        }
        removed
    }

    /// Snapshot of all unexpired records.
    pub fn list(&self) -> Vec<(String, WebhookRecord)> {
        let now = Utc::now();
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|(_, r)| !r.is_expired(now))
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    /// Earliest upcoming expiry, for diagnostics.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.values().map(|r| r.expires_at).min()
    }

    /// Best-effort durable write of the full registry map.
    pub async fn persist(&self) {
        let snapshot = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.clone()
        };
        let value = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize webhook registry");
                return;
            }
        };
        if let Err(e) = self.kv.set_value(REGISTRY_KV_KEY, &value).await {
            tracing::warn!(error = %e, "Failed to persist webhook registry");
        }
    }
}
