//! In-memory fan-out of request outcome events.
//!
//! Every request that passes through the admission pipeline produces one
//! [`Event`]. The [`EventBroker`] broadcasts events to any number of
//! subscribers, each owning a bounded queue: a slow subscriber loses events
//! rather than slowing down producers or its siblings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Record of one request outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub method: String,
    pub path: String,
    pub allowed: bool,
    /// Name of the matched rule, empty on the global fallback path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    /// Limit in effect, 0 when unknown (fail-open)
    pub limit: i64,
    /// Remaining requests, 0 when unknown (fail-open)
    pub remaining: i64,
    pub status: u16,
    /// Upstream exchange duration, 0 on the denied path
    pub response_ms: i64,
}

struct Registry {
    subscribers: RwLock<HashMap<usize, mpsc::Sender<Event>>>,
    next_id: AtomicUsize,
    buffer_size: usize,
    dropped: AtomicU64,
}

/// Fan-out broker for request outcome events.
///
/// Cloning is cheap; clones share the same subscriber registry.
#[derive(Clone)]
pub struct EventBroker {
    registry: Arc<Registry>,
}

impl EventBroker {
    /// Create a broker whose subscribers each get a queue of `buffer_size`.
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = if buffer_size == 0 { 64 } else { buffer_size };

        Self {
            registry: Arc::new(Registry {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicUsize::new(0),
                buffer_size,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Broadcast an event to all current subscribers without blocking.
    ///
    /// A subscriber whose queue is full misses this event; other subscribers
    /// still receive it.
    pub fn publish(&self, event: Event) {
        let subscribers = self.registry.subscribers.read().unwrap();

        for tx in subscribers.values() {
            if tx.try_send(event.clone()).is_err() {
                self.registry.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Register a new subscriber queue.
    ///
    /// Dropping the returned subscription (or calling
    /// [`Subscription::cancel`]) removes the queue; no further events are
    /// delivered after that.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.registry.buffer_size);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry.subscribers.write().unwrap().insert(id, tx);

        Subscription {
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.read().unwrap().len()
    }

    /// Total events dropped across all subscribers due to full queues
    pub fn dropped(&self) -> u64 {
        self.registry.dropped.load(Ordering::Relaxed)
    }
}

/// Handle to one subscriber queue.
///
/// Receives events in publish order. Also implements
/// [`futures_util::Stream`] so it can back a live streaming response.
pub struct Subscription {
    id: usize,
    rx: mpsc::Receiver<Event>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Receive the next event, or None once cancelled and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Remove this subscriber from the broker.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.subscribers.write().unwrap().remove(&self.id);
    }
}

impl futures_util::Stream for Subscription {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
