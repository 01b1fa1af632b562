use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types.
///
/// Errors never reach clients directly: the proxy handler maps every
/// admission outcome to a structured response itself (429 on denial, 502 on
/// upstream transport failure, fail-open on a degraded store), and the
/// remaining variants are fatal at startup or internal to the sink.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rule {name}: {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}
