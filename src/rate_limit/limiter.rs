use super::store::{Decision, SlidingWindowStore};
use crate::error::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Sliding-window rate limiter holding a fixed limit and window.
///
/// Used on the global fallback path when no rule matches a request; rule
/// matches carry their own limit and window straight to the store.
pub struct Limiter {
    store: Arc<dyn SlidingWindowStore>,
    limit: i64,
    window: Duration,
}

impl Limiter {
    /// Create a limiter with the provided limit and window.
    pub fn new(store: Arc<dyn SlidingWindowStore>, limit: i64, window: Duration) -> Result<Self> {
        if limit <= 0 {
            return Err(GatewayError::Config(
                "limiter: limit must be greater than 0".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatewayError::Config(
                "limiter: window must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            store,
            limit,
            window,
        })
    }

    /// Check whether a request for `identity` should be permitted.
    pub async fn allow(&self, identity: &str) -> Result<Decision> {
        if identity.is_empty() {
            return Err(GatewayError::Config(
                "limiter: identity is required".to_string(),
            ));
        }

        self.store
            .check_sliding_window(identity, self.limit, self.window)
            .await
    }

    /// The configured limit
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// The configured window
    pub fn window(&self) -> Duration {
        self.window
    }
}
