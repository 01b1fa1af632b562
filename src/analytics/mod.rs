//! Asynchronous batched persistence of request outcome events.
//!
//! The sink decouples the request path from the analytics database: `log` is
//! a non-blocking enqueue onto a bounded channel, and a single background
//! worker batches events and writes each batch in one transaction. Under
//! pressure the sink drops events and counts the drops; it never pushes
//! latency back into the request path.

use crate::error::{GatewayError, Result};
use crate::events::Event;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Sentinel rule id persisted for events admitted by the global fallback.
const GLOBAL_RULE_ID: &str = "global";

/// Analytics sink tuning
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Ingress channel capacity
    pub buffer_size: usize,
    /// Number of events per write batch
    pub batch_size: usize,
    /// Maximum time between flushes
    pub flush_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Asynchronous event writer with batching.
pub struct AnalyticsSink {
    tx: mpsc::Sender<Event>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logged: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl AnalyticsSink {
    /// Create a sink and start its background worker.
    ///
    /// The pool is expected to be validated by the caller; a dead database
    /// shows up as flush failures counted in `dropped`, not as a
    /// construction error.
    pub fn new(pool: PgPool, config: SinkConfig) -> Self {
        let buffer_size = config.buffer_size.max(1);
        let batch_size = config.batch_size.max(1);

        let (tx, rx) = mpsc::channel(buffer_size);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let logged = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(worker_loop(
            pool,
            rx,
            shutdown_rx,
            batch_size,
            config.flush_interval,
            Arc::clone(&logged),
            Arc::clone(&dropped),
        ));

        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            logged,
            dropped,
        }
    }

    /// Queue an event for persistence without blocking.
    ///
    /// Drops the event and counts it when the buffer is full or the sink is
    /// already closed.
    pub fn log(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("analytics: event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Current (logged, dropped) counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.logged.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    /// Stop the worker, draining and flushing buffered events.
    ///
    /// Returns an error when the drain does not finish within `deadline`.
    pub async fn close(&self, deadline: Duration) -> Result<()> {
        let _ = self.shutdown.send(true);

        let worker = self.worker.lock().unwrap().take();
        let Some(worker) = worker else {
            return Ok(());
        };

        match tokio::time::timeout(deadline, worker).await {
            Ok(_) => Ok(()),
            Err(_) => Err(GatewayError::Internal(
                "analytics: shutdown timeout exceeded".to_string(),
            )),
        }
    }
}

async fn worker_loop(
    pool: PgPool,
    mut rx: mpsc::Receiver<Event>,
    mut shutdown_rx: watch::Receiver<bool>,
    batch_size: usize,
    flush_interval: Duration,
    logged: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
) {
    let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => match maybe_event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(&pool, &mut batch, &logged, &dropped).await;
                    }
                }
                None => {
                    flush(&pool, &mut batch, &logged, &dropped).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&pool, &mut batch, &logged, &dropped).await;
                }
            }
            _ = shutdown_rx.changed() => {
                // Drain whatever is already queued, then stop.
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(&pool, &mut batch, &logged, &dropped).await;
                    }
                }
                flush(&pool, &mut batch, &logged, &dropped).await;
                return;
            }
        }
    }
}

/// Write one batch inside a single transaction.
///
/// Begin or commit failure drops the whole batch. A failed row inside an
/// otherwise healthy transaction is skipped and counted as dropped; `logged`
/// only reflects rows actually inserted.
async fn flush(pool: &PgPool, batch: &mut Vec<Event>, logged: &AtomicU64, dropped: &AtomicU64) {
    if batch.is_empty() {
        return;
    }
    let total = batch.len() as u64;

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!("analytics: failed to begin transaction: {}", e);
            dropped.fetch_add(total, Ordering::Relaxed);
            batch.clear();
            return;
        }
    };

    let mut inserted: u64 = 0;
    for event in batch.iter() {
        let rule_id = if event.rule_name.is_empty() {
            GLOBAL_RULE_ID
        } else {
            event.rule_name.as_str()
        };

        let result = sqlx::query(
            r#"
            INSERT INTO rate_limit_events (
                timestamp, client_id, method, path, allowed,
                rule_id, limit_value, remaining, status, response_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.timestamp)
        .bind(&event.client_id)
        .bind(&event.method)
        .bind(&event.path)
        .bind(event.allowed)
        .bind(rule_id)
        .bind(event.limit)
        .bind(event.remaining)
        .bind(event.status as i32)
        .bind(event.response_ms)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => inserted += 1,
            Err(e) => warn!("analytics: failed to insert event: {}", e),
        }
    }

    match tx.commit().await {
        Ok(()) => {
            logged.fetch_add(inserted, Ordering::Relaxed);
            dropped.fetch_add(total - inserted, Ordering::Relaxed);
            debug!("analytics: flushed {} events", inserted);
        }
        Err(e) => {
            error!("analytics: failed to commit transaction: {}", e);
            dropped.fetch_add(total, Ordering::Relaxed);
        }
    }

    batch.clear();
}
