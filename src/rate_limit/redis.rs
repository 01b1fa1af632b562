use super::lua_scripts::{INCREMENT_SCRIPT, SLIDING_WINDOW_SCRIPT};
use super::store::{bucket_index, bucket_reset_at, windowed_key, Decision, SlidingWindowStore};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed distributed sliding-window store.
///
/// Uses a reconnecting connection manager shared across request contexts and
/// pre-loaded Lua scripts so repeated checks run by SHA. The redis client
/// transparently reloads a script if it is evicted from the server cache.
pub struct RedisStore {
    connection: ConnectionManager,
    sliding_window: Script,
    increment: Script,
}

impl RedisStore {
    /// Connect to Redis, validate the connection with a PING, and pre-load
    /// the rate limiting scripts into the server script cache.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::Config(format!("invalid redis URL {:?}: {}", redis_url, e)))?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            GatewayError::StoreUnavailable(format!("failed to connect to {}: {}", redis_url, e))
        })?;

        let store = Self {
            connection,
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            increment: Script::new(INCREMENT_SCRIPT),
        };

        store.ping().await?;
        store.load_scripts().await?;

        info!("redis: connected to {}", redis_url);

        Ok(store)
    }

    async fn load_scripts(&self) -> Result<()> {
        let mut conn = self.connection.clone();

        for (name, script) in [
            ("sliding_window_check", &self.sliding_window),
            ("increment", &self.increment),
        ] {
            script
                .prepare_invoke()
                .load_async(&mut conn)
                .await
                .map_err(|e| {
                    GatewayError::StoreUnavailable(format!(
                        "failed to load script {:?}: {}",
                        name, e
                    ))
                })?;
        }

        Ok(())
    }
}

#[async_trait]
impl SlidingWindowStore for RedisStore {
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

        let mut conn = self.connection.clone();
        let result: Vec<i64> = self
            .sliding_window
            .key(&current_key)
            .key(&previous_key)
            .arg(window_ms)
            .arg(elapsed_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                GatewayError::StoreUnavailable(format!(
                    "sliding window check failed for key {:?}: {}",
                    key, e
                ))
            })?;

        if result.len() < 3 {
            return Err(GatewayError::StoreUnavailable(format!(
                "sliding window script returned {} values, expected 3",
                result.len()
            )));
        }

        let allowed = result[0] == 1;
        let current = result[1];
        let previous = result[2];

        // Mirror the script's weighted estimate; `current` already includes
        // this request when it was admitted.
        let weight = 1.0 - (elapsed_ms as f64 / window_ms as f64);
        let count = (previous as f64 * weight).floor() as i64 + current;
        let remaining = (limit - count).max(0);

        debug!(
            key,
            allowed, count, remaining, "sliding window check completed"
        );

        Ok(Decision {
            allowed,
            limit,
            remaining,
            reset_at: bucket_reset_at(bucket, window_ms),
            count,
        })
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64> {
        let window_ms = window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let window_key = windowed_key(key, bucket_index(now_ms, window_ms));

        let mut conn = self.connection.clone();
        self.increment
            .key(&window_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                GatewayError::StoreUnavailable(format!("increment failed for key {:?}: {}", key, e))
            })
    }

    async fn get_count(&self, key: &str, window: Duration) -> Result<i64> {
        let window_ms = window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let window_key = windowed_key(key, bucket_index(now_ms, window_ms));

        let mut conn = self.connection.clone();
        let count: Option<i64> = conn.get(&window_key).await.map_err(|e| {
            GatewayError::StoreUnavailable(format!("get count failed for key {:?}: {}", key, e))
        })?;

        Ok(count.unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let pattern = format!("ratelimit:{{{}}}:*", key);
        let mut conn = self.connection.clone();

        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await.map_err(|e| {
                GatewayError::StoreUnavailable(format!(
                    "scan failed for pattern {:?}: {}",
                    pattern, e
                ))
            })?;

            let mut keys = Vec::new();
            while let Some(k) = iter.next_item().await {
                keys.push(k);
            }
            keys
        };

        if !keys.is_empty() {
            let mut conn = self.connection.clone();
            conn.del::<_, ()>(keys)
                .await
                .map_err(|e| GatewayError::StoreUnavailable(format!("delete failed: {}", e)))?;
        }

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("ping failed: {}", e)))
    }
}
