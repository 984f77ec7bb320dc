//! Per-key sliding-window rate limiter with an LRU-bounded entry map.
//!
//! Timestamps are pruned lazily on access and by a background sweeper.
//! When the map is full, the least-recently-touched key is evicted and the
//! eviction is logged with the key masked.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// When denied: how long until a slot frees up.
    pub retry_after_ms: Option<u64>,
}

/// Why a client key could not be derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// `trust_proxy` is on but the forwarded header held no valid IP literal.
    InvalidForwardedIp(String),
    /// No socket address and no forwarded header.
    Unidentifiable,
}

impl KeyError {
    pub fn message(&self) -> String {
        match self {
            KeyError::InvalidForwardedIp(v) => {
                format!("Invalid client address in forwarded header: {}", v)
            }
            KeyError::Unidentifiable => "Unable to identify client address".to_string(),
        }
    }
}

/// Derive the rate-limit key for a request.
///
/// Default is the socket remote address. With `trust_proxy`, the left-most
/// entry of `X-Forwarded-For` (or `X-Real-IP`) wins, but only when it parses
/// as an IPv4/IPv6 literal; anything else is rejected upstream as a 400.
pub fn client_key(
    remote: Option<IpAddr>,
    headers: &BTreeMap<String, String>,
    trust_proxy: bool,
) -> std::result::Result<String, KeyError> {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| headers.get("x-real-ip").map(|v| v.trim()));
        if let Some(candidate) = forwarded {
            return match candidate.parse::<IpAddr>() {
                Ok(ip) => Ok(ip.to_string()),
                Err(_) => Err(KeyError::InvalidForwardedIp(candidate.to_string())),
            };
        }
    }
    remote
        .map(|ip| ip.to_string())
        .ok_or(KeyError::Unidentifiable)
}

/// Mask a key for logging: v4 keeps the first three octets, v6 keeps the
/// first two segments.
pub fn mask_key(key: &str) -> String {
    match key.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.****", o[0], o[1], o[2])
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:****", s[0], s[1])
        }
        Err(_) => "****".to_string(),
    }
}

struct Entry {
    stamps: Vec<Instant>,
    touched: u64,
}

struct LimiterState {
    entries: HashMap<String, Entry>,
    /// Monotonic touch counter used for LRU ordering.
    clock: u64,
}

/// Sliding-window limiter shared across requests.
pub struct RateLimiter {
    limit: AtomicUsize,
    window: Duration,
    max_entries: usize,
    state: Mutex<LimiterState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter. `window` and `max_entries` must be positive.
    pub fn new(limit: usize, window: Duration, max_entries: usize) -> Result<Self> {
        if window.is_zero() {
            return Err(Error::RateLimiter("window must be positive".to_string()));
        }
        if max_entries == 0 {
            return Err(Error::RateLimiter("max_entries must be positive".to_string()));
        }
        Ok(Self {
            limit: AtomicUsize::new(limit),
            window,
            max_entries,
            state: Mutex::new(LimiterState {
                entries: HashMap::new(),
                clock: 0,
            }),
            sweeper: Mutex::new(None),
        })
    }

    /// Current per-window limit.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Window size.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Hot-reload entry point: replace the per-window limit.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Check and record one request for `key`.
    pub fn check(&self, key: &str) -> RateDecision {
        let limit = self.limit();
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clock += 1;
        let clock = state.clock;

        if !state.entries.contains_key(key) && state.entries.len() >= self.max_entries {
            // Evict the least-recently-touched entry to make room.
            if let Some(victim) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&victim);
                tracing::info!(key = %mask_key(&victim), "Rate limiter evicted LRU entry");
            }
        }

        let window = self.window;
        let entry = state.entries.entry(key.to_string()).or_insert(Entry {
            stamps: Vec::new(),
            touched: clock,
        });
        entry.touched = clock;
        entry.stamps.retain(|t| now.duration_since(*t) < window);

        if entry.stamps.len() >= limit {
            let retry_after = entry
                .stamps
                .first()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return RateDecision {
                allowed: false,
                retry_after_ms: Some(retry_after.as_millis() as u64),
            };
        }

        entry.stamps.push(now);
        RateDecision {
            allowed: true,
            retry_after_ms: None,
        }
    }

    /// Drop entries whose timestamps have all expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| e.stamps.iter().any(|t| now.duration_since(*t) < window));
        before - state.entries.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the background sweeper. Idempotent; the previous sweeper is
    /// cancelled if one was running.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let limiter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Rate limiter sweep");
                }
            }
        });
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the background sweeper.
    pub fn close(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}
