//! In-process event bus feeding live log-stream subscribers.
//!
//! Built on a bounded broadcast ring: each subscriber reads at its own
//! pace and a slow subscriber loses the oldest frames rather than stalling
//! the publisher. Subscriber count is capped; connects beyond the cap are
//! refused with a user-facing error.

use crate::types::EventRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Per-subscriber frame buffer (drop-oldest on overflow).
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Default cap on concurrent subscribers.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 100;

/// Publisher half of the bus.
pub struct EventBus {
    tx: broadcast::Sender<Arc<EventRecord>>,
    subscribers: Arc<AtomicUsize>,
    max_subscribers: usize,
}

/// A live subscription; dropping it releases the slot.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<EventRecord>>,
    subscribers: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new(max_subscribers: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_CAPACITY);
        Self {
            tx,
            subscribers: Arc::new(AtomicUsize::new(0)),
            max_subscribers,
        }
    }

    /// Publish an event to every live subscriber. No subscribers is fine.
    pub fn emit(&self, event: Arc<EventRecord>) {
        let _ = self.tx.send(event);
    }

    /// Register a subscriber, or `None` when the cap is reached.
    pub fn subscribe(&self) -> Option<Subscription> {
        let mut current = self.subscribers.load(Ordering::Acquire);
        loop {
            if current >= self.max_subscribers {
                return None;
            }
            match self.subscribers.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Some(Subscription {
            rx: self.tx.subscribe(),
            subscribers: Arc::clone(&self.subscribers),
        })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    pub fn max_subscribers(&self) -> usize {
        self.max_subscribers
    }
}

impl Subscription {
    /// Next event, skipping over frames lost to a full queue. `None` when
    /// the bus has shut down.
    pub async fn recv(&mut self) -> Option<Arc<EventRecord>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(dropped = n, "Subscriber lagged; oldest frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::AcqRel);
    }
}
