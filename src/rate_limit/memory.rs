use super::store::{bucket_index, bucket_reset_at, windowed_key, Decision, SlidingWindowStore};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// In-process sliding-window store.
///
/// Runs the same weighted two-bucket algorithm as [`RedisStore`] against a
/// local map guarded by a mutex, which stands in for the server-side script
/// atomicity. Counters are never evicted, so this backend is meant for
/// single-process development and tests, not production deployments.
///
/// [`RedisStore`]: super::RedisStore
#[derive(Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlidingWindowStore for MemoryStore {
    async fn check_sliding_window(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<Decision> {
        if limit <= 0 {
            return Err(GatewayError::Config(
                "rate limit must be greater than 0".to_string(),
            ));
        }
        let window_ms = window.as_millis() as i64;
        if window_ms <= 0 {
            return Err(GatewayError::Config(
                "rate limit window must be greater than 0".to_string(),
            ));
        }

        let now_ms = Utc::now().timestamp_millis();
        let bucket = bucket_index(now_ms, window_ms);
        let elapsed_ms = now_ms % window_ms;

        let current_key = windowed_key(key, bucket);
        let previous_key = windowed_key(key, bucket - 1);

        let mut counters = self.counters.lock().unwrap();
        let current = counters.get(&current_key).copied().unwrap_or(0);
        let previous = counters.get(&previous_key).copied().unwrap_or(0);

        let weight = 1.0 - (elapsed_ms as f64 / window_ms as f64);
        let estimated = (previous as f64 * weight).floor() as i64 + current;

        let (allowed, count) = if estimated >= limit {
            (false, estimated)
        } else {
            counters.insert(current_key, current + 1);
            (true, estimated + 1)
        };

        Ok(Decision {
            allowed,
            limit,
            remaining: (limit - count).max(0),
            reset_at: bucket_reset_at(bucket, window_ms),
            count,
        })
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64> {
        let window_ms = window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let window_key = windowed_key(key, bucket_index(now_ms, window_ms));

        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(window_key).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn get_count(&self, key: &str, window: Duration) -> Result<i64> {
        let window_ms = window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let window_key = windowed_key(key, bucket_index(now_ms, window_ms));

        let counters = self.counters.lock().unwrap();
        Ok(counters.get(&window_key).copied().unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let prefix = format!("ratelimit:{{{}}}:", key);
        let mut counters = self.counters.lock().unwrap();
        counters.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
