//! External collaborator interfaces: key-value store, dataset sink, and
//! queryable event store.
//!
//! The host platform provides these in production; the default
//! implementations here are file-backed (JSON documents and an append-only
//! JSONL dataset) so the service runs standalone. Transient collaborator
//! failures are the caller's problem to tolerate: every consumer of these
//! traits logs and continues.

use crate::error::{Error, Result};
use crate::types::EventRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// Key-value store: registry persistence and raw-config input.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}

/// Append-only dataset sink for event records.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn push(&self, event: &EventRecord) -> Result<()>;
}

/// Query filters for the logs endpoint.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub webhook_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Queryable event store for replay and log queries.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Exact id match within one webhook's events.
    async fn find_by_id(&self, webhook_id: &str, event_id: &str) -> Result<Option<EventRecord>>;
    /// Timestamp match, used only when the id lookup misses.
    async fn find_by_timestamp(
        &self,
        webhook_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<EventRecord>>;
    /// Most-recent-first scan with filters.
    async fn query(&self, query: &LogQuery) -> Result<Vec<EventRecord>>;
}

// === File-backed key-value store ===

/// JSON-document-per-key store under a state directory.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are well-known identifiers; anything path-like is rejected.
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::Storage(format!("invalid store key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        // Write-then-rename so readers never observe a torn document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// === JSONL event store ===

/// Append-only `events.jsonl` dataset that doubles as the query store.
///
/// Appends go through a tokio file handle guarded by an async-aware lock;
/// queries re-read the file, which keeps the implementation honest about
/// the "external collaborator" contract (no shared in-process index).
pub struct JsonlEventStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<EventRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, "Skipping unparseable dataset line"),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventSink for JsonlEventStore {
    async fn push(&self, event: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn find_by_id(&self, webhook_id: &str, event_id: &str) -> Result<Option<EventRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|e| e.webhook_id == webhook_id && e.id == event_id))
    }

    async fn find_by_timestamp(
        &self,
        webhook_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<EventRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|e| e.webhook_id == webhook_id && e.timestamp == timestamp))
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<EventRecord>> {
        let mut events = self.read_all().await?;
        events.retain(|e| {
            query
                .webhook_id
                .as_deref()
                .is_none_or(|id| e.webhook_id == id)
                && query.since.is_none_or(|since| e.timestamp >= since)
        });
        events.reverse(); // newest first
        events.truncate(query.limit);
        Ok(events)
    }
}

// === In-memory doubles ===

/// In-memory key-value store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// In-memory sink + store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<EventRecord>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventStore {
    async fn push(&self, event: &EventRecord) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find_by_id(&self, webhook_id: &str, event_id: &str) -> Result<Option<EventRecord>> {
        Ok(self
            .events()
            .into_iter()
            .find(|e| e.webhook_id == webhook_id && e.id == event_id))
    }

    async fn find_by_timestamp(
        &self,
        webhook_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<EventRecord>> {
        Ok(self
            .events()
            .into_iter()
            .find(|e| e.webhook_id == webhook_id && e.timestamp == timestamp))
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<EventRecord>> {
        let mut events = self.events();
        events.retain(|e| {
            query
                .webhook_id
                .as_deref()
                .is_none_or(|id| e.webhook_id == id)
                && query.since.is_none_or(|since| e.timestamp >= since)
        });
        events.reverse();
        events.truncate(query.limit);
        Ok(events)
    }
}
