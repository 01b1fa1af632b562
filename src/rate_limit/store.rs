use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of a rate limit check against the store
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request should be permitted
    pub allowed: bool,
    /// Maximum allowed requests in the window
    pub limit: i64,
    /// How many requests are still allowed
    pub remaining: i64,
    /// When the current window bucket expires
    pub reset_at: DateTime<Utc>,
    /// Estimated request count in the rolling window, including this
    /// request when it was admitted
    pub count: i64,
}

/// Storage backend for sliding-window rate limit state.
///
/// `check_sliding_window` must execute atomically on the store: the read of
/// both bucket counters, the comparison, and the conditional increment may
/// not interleave with other clients' operations on the same key.
///
/// All methods must be safe for concurrent use. Backend failures surface as
/// [`GatewayError::StoreUnavailable`](crate::error::GatewayError), never as
/// a denial.
#[async_trait]
pub trait SlidingWindowStore: Send + Sync {
    /// Perform a sliding-window check for `key`, incrementing the current
    /// bucket counter when the request is admitted.
    async fn check_sliding_window(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<Decision>;

    /// Atomically increment the windowed counter for `key` and return the
    /// count after incrementing.
    async fn increment(&self, key: &str, window: Duration) -> Result<i64>;

    /// Return the current count for `key` within the current window bucket.
    async fn get_count(&self, key: &str, window: Duration) -> Result<i64>;

    /// Remove all rate limiting state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Check connectivity to the backend.
    async fn ping(&self) -> Result<()>;
}

/// Construct a Redis key scoped to a specific window bucket.
///
/// The hash-tag braces pin every bucket of one logical key to the same
/// cluster shard so the check script can read both buckets in one call.
pub(crate) fn windowed_key(key: &str, bucket: i64) -> String {
    format!("ratelimit:{{{}}}:{}", key, bucket)
}

/// Compute the bucket index for an instant, in milliseconds since epoch.
pub(crate) fn bucket_index(now_ms: i64, window_ms: i64) -> i64 {
    now_ms / window_ms
}

/// Compute the instant at which the given bucket's window expires.
pub(crate) fn bucket_reset_at(bucket: i64, window_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis((bucket + 1) * window_ms).unwrap_or_else(Utc::now)
}
