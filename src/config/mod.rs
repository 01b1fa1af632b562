use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream backend configuration
    pub upstream: UpstreamConfig,
    /// Redis configuration for the distributed rate limit store
    #[serde(default)]
    pub redis: RedisConfig,
    /// Global fallback rate limit (applied when no rule matches)
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Live event stream configuration
    #[serde(default)]
    pub events: EventsConfig,
    /// Analytics persistence configuration (absent disables persistence)
    #[serde(default)]
    pub analytics: Option<AnalyticsConfig>,
    /// Trust X-Forwarded-For headers for client identification.
    /// Only enable this when the gateway sits behind a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path prefix under which requests are proxied to the upstream
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    /// Deadline for draining in-flight work on shutdown, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Upstream backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream base URL (scheme://host[:port][/basepath])
    pub url: String,
    /// Total timeout for an upstream exchange, in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    /// Timeout for establishing the upstream connection, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Timeout for a single store call, in seconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
}

/// Global fallback rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed per window
    #[serde(default = "default_requests")]
    pub requests: i64,
    /// Sliding window duration in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

/// Event broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber queue capacity
    #[serde(default = "default_event_buffer")]
    pub buffer_size: usize,
}

/// Analytics sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// PostgreSQL/TimescaleDB connection string
    pub database_url: String,
    /// Ingress channel capacity
    #[serde(default = "default_analytics_buffer")]
    pub buffer_size: usize,
    /// Number of events per write batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time between flushes, in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_proxy_prefix() -> String {
    "/proxy".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    3
}

fn default_requests() -> i64 {
    100
}

fn default_window() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    256
}

fn default_analytics_buffer() -> usize {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy_prefix: default_proxy_prefix(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            store_timeout_secs: default_store_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            window_secs: default_window(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_event_buffer(),
        }
    }
}

impl ServerConfig {
    /// Get the shutdown deadline as a Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl RateLimitConfig {
    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl AnalyticsConfig {
    /// Get the flush interval as a Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.upstream.url.is_empty() {
            return Err(GatewayError::Config(
                "Upstream URL cannot be empty".to_string(),
            ));
        }

        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://") {
            return Err(GatewayError::Config(format!(
                "Upstream URL must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }

        if !self.server.proxy_prefix.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "Proxy prefix must start with /, got: {}",
                self.server.proxy_prefix
            )));
        }

        if self.server.proxy_prefix.len() > 1 && self.server.proxy_prefix.ends_with('/') {
            return Err(GatewayError::Config(
                "Proxy prefix must not end with /".to_string(),
            ));
        }

        if self.redis.url.is_empty() {
            return Err(GatewayError::Config("Redis URL cannot be empty".to_string()));
        }

        if self.rate_limit.requests <= 0 {
            return Err(GatewayError::Config(
                "Global rate limit requests must be > 0".to_string(),
            ));
        }

        if self.rate_limit.window_secs == 0 {
            return Err(GatewayError::Config(
                "Global rate limit window must be > 0".to_string(),
            ));
        }

        if let Some(analytics) = &self.analytics {
            if analytics.database_url.is_empty() {
                return Err(GatewayError::Config(
                    "Analytics database URL cannot be empty".to_string(),
                ));
            }
            if analytics.batch_size == 0 {
                return Err(GatewayError::Config(
                    "Analytics batch size must be > 0".to_string(),
                ));
            }
            if analytics.flush_interval_secs == 0 {
                return Err(GatewayError::Config(
                    "Analytics flush interval must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}
