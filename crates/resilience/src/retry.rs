//! Retry with exponential backoff and jitter
//!
//! A [`Retry`] calls an operation up to `max_attempts` times. Between
//! attempts it sleeps for an exponentially growing wait
//! (`wait_{i+1} = min(wait_i * multiplier, max_wait)`), each realized wait
//! jittered by up to `±jitter` of itself. The first success is returned; if
//! every attempt fails the last attempt's error is returned as is.
//!
//! Jitter comes from a [`JitterSource`] owned by each `Retry`, so concurrent
//! retries do not move in lockstep and tests can use a seeded source.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::error::{ConfigError, ConfigResult, ResilienceError};

//==============================================================================
// Jitter sources
//==============================================================================

/// Uniform random numbers in `[0, 1)` used to jitter backoff waits.
pub trait JitterSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Thread-local RNG; unpredictable and independent across retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngSource;

impl JitterSource for ThreadRngSource {
    fn next_unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Seeded RNG producing a reproducible sequence.
pub struct SeededSource {
    rng: Mutex<StdRng>,
}

impl fmt::Debug for SeededSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededSource").finish_non_exhaustive()
    }
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl JitterSource for SeededSource {
    fn next_unit(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait after the first failed attempt
    pub initial_wait: Duration,
    /// Upper bound for the un-jittered wait
    pub max_wait: Duration,
    /// Growth factor applied after each wait
    pub multiplier: f64,
    /// Fraction of each wait that is randomized, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid("multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("jitter must be within [0, 1]"));
        }
        if self.initial_wait > self.max_wait {
            return Err(ConfigError::invalid("initial_wait must not exceed max_wait"));
        }
        Ok(())
    }
}

/// Builder for RetryConfig
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_wait(mut self, wait: Duration) -> Self {
        self.config.initial_wait = wait;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait = wait;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = 0.0;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Retry
//==============================================================================

/// Backoff-driven call loop.
pub struct Retry {
    config: RetryConfig,
    source: Arc<dyn JitterSource>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Retry {
    /// Retry jittered by the thread-local RNG.
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        Self::with_source(config, ThreadRngSource)
    }

    /// Retry jittered by a caller-supplied source.
    pub fn with_source<S>(config: RetryConfig, source: S) -> ConfigResult<Self>
    where
        S: JitterSource + 'static,
    {
        config.validate()?;
        Ok(Self { config, source: Arc::new(source) })
    }

    /// Retry with a reproducible jitter sequence.
    pub fn seeded(config: RetryConfig, seed: u64) -> ConfigResult<Self> {
        Self::with_source(config, SeededSource::new(seed))
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Realized waits between consecutive attempts.
    ///
    /// Yields `max_attempts - 1` durations; each call draws fresh jitter.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: &self.config,
            source: self.source.as_ref(),
            next_wait: self.config.initial_wait,
            remaining: self.config.max_attempts.saturating_sub(1),
        }
    }

    /// Run a blocking operation, sleeping the calling thread between
    /// attempts.
    pub fn call<F, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut delays = self.backoff();
        let mut attempt = 1u32;
        loop {
            let error = match operation() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let Some(delay) = delays.next() else {
                warn!(attempts = attempt, "retry attempts exhausted");
                return Err(error);
            };
            debug!(attempt, ?delay, "attempt failed, backing off");
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Run an async operation, creating a fresh future for each attempt.
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delays = self.backoff();
        let mut attempt = 1u32;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let Some(delay) = delays.next() else {
                warn!(attempts = attempt, "retry attempts exhausted");
                return Err(error);
            };
            debug!(attempt, ?delay, "attempt failed, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Like [`execute`](Self::execute), but stops with `Cancelled` once
    /// `cancel` fires, before an attempt or during a backoff sleep.
    #[instrument(skip(self, cancel, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let mut delays = self.backoff();
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled.into());
            }
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let Some(delay) = delays.next() else {
                warn!(attempts = attempt, "retry attempts exhausted");
                return Err(error);
            };
            debug!(attempt, ?delay, "attempt failed, backing off");
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempt, "retry cancelled during backoff");
                    return Err(ResilienceError::Cancelled.into());
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Retry through a shared breaker: every attempt is admitted by `breaker`
    /// and counts toward tripping it. Once it opens, the remaining attempts
    /// fail fast with `CircuitOpen` without `operation` being called.
    #[instrument(skip(self, breaker, operation), fields(breaker = breaker.name()))]
    pub async fn with_circuit_breaker<C, F, Fut, T, E>(
        &self,
        breaker: &CircuitBreaker<C>,
        mut operation: F,
    ) -> Result<T, E>
    where
        C: Clock,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + From<ResilienceError> + 'static,
    {
        let mut delays = self.backoff();
        let mut attempt = 1u32;
        loop {
            let error = match breaker.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let Some(delay) = delays.next() else {
                warn!(attempts = attempt, "retry attempts exhausted");
                return Err(error);
            };
            debug!(attempt, ?delay, "attempt failed, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Blocking variant of [`with_circuit_breaker`](Self::with_circuit_breaker).
    pub fn call_with_circuit_breaker<C, F, T, E>(
        &self,
        breaker: &CircuitBreaker<C>,
        mut operation: F,
    ) -> Result<T, E>
    where
        C: Clock,
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + From<ResilienceError> + 'static,
    {
        self.call(|| breaker.call(&mut operation))
    }
}

/// Iterator over jittered backoff waits; see [`Retry::backoff`].
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    source: &'a dyn JitterSource,
    next_wait: Duration,
    remaining: u32,
}

impl fmt::Debug for Backoff<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("next_wait", &self.next_wait)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Backoff<'_> {
    fn jittered(&self, wait: Duration) -> Duration {
        if self.config.jitter == 0.0 {
            return wait;
        }
        let spread = self.config.jitter * 2.0f64.mul_add(self.source.next_unit(), -1.0);
        Duration::try_from_secs_f64(wait.as_secs_f64() * (1.0 + spread)).unwrap_or(wait)
    }
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let wait = self.next_wait;
        self.next_wait = Duration::try_from_secs_f64(wait.as_secs_f64() * self.config.multiplier)
            .map_or(self.config.max_wait, |grown| grown.min(self.config.max_wait));
        Some(self.jittered(wait))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}
