//! Fault-tolerance primitives for calls to downstream services.
//!
//! - **Circuit breaker**: stops calling a dependency that keeps failing and
//!   tries it again after a cool-down
//! - **Bulkhead**: caps concurrent calls, with a bounded wait queue
//! - **Rate limiting**: token bucket, sliding window and per-key buckets
//! - **Retry**: exponential backoff with jitter
//! - **Registries**: one named instance per downstream service
//!
//! Primitives compose by nesting closures. Wrapped operations return
//! `Result<T, E>` where `E: From<ResilienceError>`; the operation's own error
//! comes back unchanged and rejections arrive as your `ResilienceError`
//! variant.
//!
//! ```rust
//! use revenge_resilience::{Bulkhead, BulkheadConfig, ResilienceError};
//!
//! #[derive(Debug, thiserror::Error)]
//! enum FetchError {
//!     #[error("upstream returned {0}")]
//!     Status(u16),
//!     #[error(transparent)]
//!     Policy(#[from] ResilienceError),
//! }
//!
//! # tokio_test::block_on(async {
//! let config = BulkheadConfig::builder().name("tmdb").max_concurrent(4).build().unwrap();
//! let bulkhead = Bulkhead::new(config).unwrap();
//! let body = bulkhead.execute(|| async { Ok::<_, FetchError>("ok") }).await;
//! assert_eq!(body.unwrap(), "ok");
//! # });
//! ```
//!
//! # Feature Tiers
//!
//! - `runtime` (default): every primitive, registries and settings
//! - `config`: TOML loading of [`ResilienceSettings`]
//! - `metrics`: Prometheus export

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

#[cfg(feature = "runtime")]
pub mod bulkhead;
#[cfg(feature = "runtime")]
pub mod circuit_breaker;
#[cfg(feature = "runtime")]
pub mod clock;
#[cfg(feature = "runtime")]
pub mod config;
#[cfg(feature = "runtime")]
pub mod error;
#[cfg(feature = "runtime")]
pub mod notify;
#[cfg(feature = "runtime")]
pub mod per_key;
#[cfg(feature = "runtime")]
pub mod rate_limiter;
#[cfg(feature = "runtime")]
pub mod registry;
#[cfg(feature = "runtime")]
pub mod retry;

#[cfg(feature = "metrics")]
pub mod metrics;

// Re-exports
// ------------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadStats};
#[cfg(feature = "runtime")]
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerStats,
    CircuitState, SuccessClassifier,
};
#[cfg(feature = "runtime")]
pub use clock::{Clock, MockClock, SystemClock, TokioClock};
#[cfg(feature = "runtime")]
pub use config::{Registries, ResilienceSettings};
#[cfg(feature = "runtime")]
pub use error::{ConfigError, ConfigResult, ResilienceError};
#[cfg(feature = "metrics")]
pub use metrics::ResilienceMetrics;
#[cfg(feature = "runtime")]
pub use notify::{OnReject, OnStateChange, Rejection, StateChange};
#[cfg(feature = "runtime")]
pub use per_key::PerKeyLimiter;
#[cfg(feature = "runtime")]
pub use rate_limiter::{
    RateLimiterConfig, RateLimiterConfigBuilder, RateLimiterStats, SlidingWindowLimiter,
    TokenBucketLimiter,
};
#[cfg(feature = "runtime")]
pub use registry::{BulkheadRegistry, CircuitBreakerRegistry, NamedRegistry, RateLimiterRegistry};
#[cfg(feature = "runtime")]
pub use retry::{
    Backoff, JitterSource, Retry, RetryConfig, RetryConfigBuilder, SeededSource, ThreadRngSource,
};
#[cfg(feature = "runtime")]
pub use tokio_util::sync::CancellationToken;
