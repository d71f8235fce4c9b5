//! Rate limiting implementations for controlling request rates
//!
//! - **Token bucket**: permits accrue continuously at `rate` per second up to
//!   `burst`; each admitted request debits exactly the permits it asked for.
//!   Callers can either test (`allow`) or wait for permits (`wait`).
//! - **Sliding window**: counts admissions in the trailing second.
//!
//! Keyed limiting on top of the token bucket lives in
//! [`per_key`](crate::per_key).

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError};

/// Window length of [`SlidingWindowLimiter`].
pub const SLIDING_WINDOW: Duration = Duration::from_secs(1);

/// Configuration for token bucket rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Name reported in logs and stats.
    pub name: String,
    /// Permits added per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// Longest a `wait` may sleep; `None` waits as long as the deficit needs.
    pub wait_timeout: Option<Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { name: "default".to_string(), rate: 10.0, burst: 20, wait_timeout: None }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ConfigError::invalid("rate must be a finite value greater than 0"));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("burst must be greater than 0"));
        }
        Ok(())
    }

    /// Copy of this configuration under another name.
    pub fn named(&self, name: &str) -> Self {
        Self { name: name.to_string(), ..self.clone() }
    }
}

/// Builder for RateLimiterConfig
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn rate(mut self, per_second: f64) -> Self {
        self.config.rate = per_second;
        self
    }

    pub fn burst(mut self, burst: u32) -> Self {
        self.config.burst = burst;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a token bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub rate: f64,
    pub burst: u32,
    /// Permits available right now, after refill.
    pub available: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// # Examples
///
/// ```rust
/// use revenge_resilience::{RateLimiterConfig, TokenBucketLimiter};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = TokenBucketLimiter::new(RateLimiterConfig::builder().rate(10.0).burst(10).build()?)?;
///
/// assert!(limiter.allow_n(10));
/// assert!(!limiter.allow());
/// # Ok(())
/// # }
/// ```
pub struct TokenBucketLimiter<C: Clock = SystemClock> {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
    clock: C,
}

impl<C: Clock> fmt::Debug for TokenBucketLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.config)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

impl TokenBucketLimiter<SystemClock> {
    /// Create a full bucket using the system clock
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TokenBucketLimiter<C> {
    /// Create a full bucket with a custom clock
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, clock))
    }

    pub(crate) fn from_validated(config: RateLimiterConfig, clock: C) -> Self {
        let state = BucketState { tokens: f64::from(config.burst), last_refill: clock.now() };
        Self { config, state: Mutex::new(state), clock }
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Active configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.burst)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = elapsed
            .as_secs_f64()
            .mul_add(self.config.rate, state.tokens)
            .min(self.capacity());
        state.last_refill = now;
    }

    /// Take one permit if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Take `n` permits if all of them are available.
    pub fn allow_n(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let wanted = f64::from(n);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Wait for one permit.
    ///
    /// The wait sleeps on tokio's timer and then re-reads the limiter's
    /// clock, so the clock must move with that timer. A [`MockClock`] does
    /// not; under paused tokio time use [`TokioClock`].
    ///
    /// [`MockClock`]: crate::clock::MockClock
    /// [`TokioClock`]: crate::clock::TokioClock
    pub async fn wait(&self) -> Result<(), ResilienceError> {
        self.acquire(1, None).await
    }

    /// Wait for `n` permits.
    pub async fn wait_n(&self, n: u32) -> Result<(), ResilienceError> {
        self.acquire(n, None).await
    }

    /// Wait for one permit, giving up with `Cancelled` when `cancel` fires.
    pub async fn wait_with_cancel(&self, cancel: &CancellationToken) -> Result<(), ResilienceError> {
        self.acquire(1, Some(cancel)).await
    }

    /// Wait for `n` permits, giving up with `Cancelled` when `cancel` fires.
    pub async fn wait_n_with_cancel(
        &self,
        n: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ResilienceError> {
        self.acquire(n, Some(cancel)).await
    }

    #[instrument(level = "debug", skip(self, cancel), fields(name = %self.config.name))]
    async fn acquire(&self, n: u32, cancel: Option<&CancellationToken>) -> Result<(), ResilienceError> {
        if self.allow_n(n) {
            return Ok(());
        }
        if n > self.config.burst {
            debug!(n, burst = self.config.burst, "request exceeds bucket capacity");
            return Err(ResilienceError::RateLimited);
        }

        let delay = self.deficit_delay(n)?;
        if self.config.wait_timeout.is_some_and(|limit| delay > limit) {
            debug!(?delay, "token wait exceeds wait_timeout");
            return Err(ResilienceError::RateLimited);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = cancelled => return Err(ResilienceError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }

        if self.allow_n(n) {
            Ok(())
        } else {
            debug!("permits still unavailable after waiting");
            Err(ResilienceError::RateLimited)
        }
    }

    /// Time until `n` permits will have accrued, rounded up to whole
    /// milliseconds.
    fn deficit_delay(&self, n: u32) -> Result<Duration, ResilienceError> {
        let tokens = {
            let mut state = self.state.lock();
            self.refill(&mut state);
            state.tokens
        };
        let secs = ((f64::from(n) - tokens).max(0.0) / self.config.rate * 1000.0).ceil() / 1000.0;
        Duration::try_from_secs_f64(secs).map_err(|_| ResilienceError::RateLimited)
    }

    /// Permits available now.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Whether the bucket is at capacity (idle since it last filled).
    pub fn is_full(&self) -> bool {
        self.available() >= self.capacity()
    }

    /// Refill the bucket completely.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.capacity();
        state.last_refill = self.clock.now();
    }

    /// Snapshot for observability.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.config.name.clone(),
            rate: self.config.rate,
            burst: self.config.burst,
            available: self.available(),
        }
    }
}

/// Admits at most `rate` requests in any trailing one-second window.
///
/// Keeps one timestamp per admission, so it suits small rates.
pub struct SlidingWindowLimiter<C: Clock = SystemClock> {
    rate: usize,
    admitted: Mutex<VecDeque<Instant>>,
    clock: C,
}

impl<C: Clock> fmt::Debug for SlidingWindowLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("rate", &self.rate)
            .field("in_window", &self.admitted.lock().len())
            .finish()
    }
}

impl SlidingWindowLimiter<SystemClock> {
    pub fn new(rate: usize) -> ConfigResult<Self> {
        Self::with_clock(rate, SystemClock)
    }
}

impl<C: Clock> SlidingWindowLimiter<C> {
    pub fn with_clock(rate: usize, clock: C) -> ConfigResult<Self> {
        if rate == 0 {
            return Err(ConfigError::invalid("rate must be greater than 0"));
        }
        Ok(Self { rate, admitted: Mutex::new(VecDeque::with_capacity(rate)), clock })
    }

    fn prune(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while admitted
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) >= SLIDING_WINDOW)
        {
            admitted.pop_front();
        }
    }

    /// Admit and record the request if the window has room.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock();
        self.prune(&mut admitted, now);
        if admitted.len() < self.rate {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Admissions within the current window.
    pub fn current_count(&self) -> usize {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock();
        self.prune(&mut admitted, now);
        admitted.len()
    }

    pub fn rate(&self) -> usize {
        self.rate
    }
}
