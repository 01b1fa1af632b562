//! Distributed sliding-window rate limiting.
//!
//! The decision algorithm is a weighted two-bucket sliding window executed
//! atomically on the store: time is partitioned into fixed buckets of the
//! window width, and the estimated count weighs the previous bucket by the
//! fraction of it still inside the rolling window.
//!
//! The multi-step read/compare/increment/expire sequence runs as a single
//! Lua script on Redis so concurrent checks against the same identifier see
//! a consistent counter snapshot.
//!
//! # Example
//!
//! ```rust,no_run
//! use limitgate::rate_limit::{Limiter, RedisStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(
//!         RedisStore::connect("redis://127.0.0.1:6379")
//!             .await
//!             .expect("redis unavailable"),
//!     );
//!
//!     let limiter = Limiter::new(store, 100, Duration::from_secs(60)).unwrap();
//!     let decision = limiter.allow("203.0.113.7").await.unwrap();
//!     println!("allowed={} remaining={}", decision.allowed, decision.remaining);
//! }
//! ```

pub mod limiter;
pub mod lua_scripts;
pub mod memory;
pub mod redis;
pub mod store;

pub use limiter::Limiter;
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use store::{Decision, SlidingWindowStore};
