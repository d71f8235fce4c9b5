//! Circuit breaker guarding a single logical dependency.
//!
//! The breaker is a three-state machine. In `Closed` every call is admitted
//! and failures are counted. Once the failure count (or ratio) crosses its
//! threshold the breaker trips to `Open` and rejects calls without running
//! them. After `timeout` it admits a bounded number of trial calls in `HalfOpen`;
//! enough successful trial calls close it again, a single failed trial reopens it.
//!
//! All state lives behind one lock that is never held while the wrapped
//! operation runs.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError};
use crate::notify::{EventNotifier, OnStateChange, StateChange, DEFAULT_EVENT_QUEUE};

//==============================================================================
// State & Configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls are rejected until the timeout elapses.
    Open,
    /// A limited number of trial calls test whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label (`closed`, `open`, `half-open`).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether an operation error should still count as a success.
///
/// Only consulted for `Err` results; `Ok` is always a success.
pub type SuccessClassifier = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Configuration for circuit breaker behavior
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Name reported in logs, stats and events.
    pub name: String,
    /// Failures (consecutive in count mode) before tripping.
    pub max_failures: u32,
    /// Failure ratio that trips the breaker; `0.0` disables ratio mode.
    pub failure_ratio: f64,
    /// Requests required before ratio mode is evaluated.
    pub min_requests: u32,
    /// Time spent open before a trial call is admitted.
    pub timeout: Duration,
    /// Trial quota in half-open, also the successes needed to close.
    pub max_half_open_requests: u32,
    /// Callback for state transitions, delivered in order off the call path.
    pub on_state_change: Option<OnStateChange>,
    /// Error classifier; by default every error is a failure.
    pub is_successful: Option<SuccessClassifier>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("max_failures", &self.max_failures)
            .field("failure_ratio", &self.failure_ratio)
            .field("min_requests", &self.min_requests)
            .field("timeout", &self.timeout)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("is_successful", &self.is_successful.is_some())
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_failures: 5,
            failure_ratio: 0.0,
            min_requests: 10,
            timeout: Duration::from_secs(30),
            max_half_open_requests: 3,
            on_state_change: None,
            is_successful: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_failures == 0 {
            return Err(ConfigError::invalid("max_failures must be greater than 0"));
        }
        if self.max_half_open_requests == 0 {
            return Err(ConfigError::invalid("max_half_open_requests must be greater than 0"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(ConfigError::invalid("failure_ratio must be within [0, 1]"));
        }
        Ok(())
    }

    /// Copy of this configuration under another name.
    pub fn named(&self, name: &str) -> Self {
        Self { name: name.to_string(), ..self.clone() }
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.config.max_failures = max_failures;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.config.failure_ratio = ratio;
        self
    }

    pub fn min_requests(mut self, min_requests: u32) -> Self {
        self.config.min_requests = min_requests;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_half_open_requests(mut self, max: u32) -> Self {
        self.config.max_half_open_requests = max;
        self
    }

    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.config.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Treat errors matching `classifier` as successes (e.g. "not found").
    pub fn is_successful<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.is_successful = Some(Arc::new(classifier));
        self
    }

    /// Set a custom clock for the circuit breaker (useful for testing)
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { config: self.config, clock }
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a CircuitBreaker directly
#[derive(Debug)]
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::with_clock(self.config, self.clock)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub requests: u64,
    pub half_open_count: u64,
    pub last_state_change: SystemTime,
}

//==============================================================================
// Circuit Breaker
//==============================================================================

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    requests: u64,
    half_open_count: u64,
    expiry: Option<Instant>,
    last_state_change: SystemTime,
}

impl BreakerState {
    fn clear_counters(&mut self) {
        self.failures = 0;
        self.successes = 0;
        self.requests = 0;
        self.half_open_count = 0;
    }
}

/// One admitted call. Dropping it without a recorded result counts as a
/// failure, so an abandoned half-open trial cannot hold its slot forever.
struct Admission<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    recorded: bool,
}

impl<'a, C: Clock> Admission<'a, C> {
    fn new(breaker: &'a CircuitBreaker<C>) -> Self {
        Self { breaker, recorded: false }
    }

    fn finish<T, E>(mut self, result: &Result<T, E>)
    where
        E: Error + 'static,
    {
        self.recorded = true;
        self.breaker.after_request(result);
    }
}

impl<C: Clock> Drop for Admission<'_, C> {
    fn drop(&mut self) {
        if !self.recorded {
            debug!(name = %self.breaker.config.name, "admitted call abandoned, counting as failure");
            self.breaker.record(false);
        }
    }
}

/// Failure-counting circuit breaker.
///
/// Generic over [`Clock`] so tests can drive the open timeout with a
/// [`MockClock`](crate::MockClock).
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    notifier: Option<EventNotifier<StateChange>>,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failures", &inner.failures)
            .field("requests", &inner.requests)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, clock))
    }

    pub(crate) fn from_validated(config: CircuitBreakerConfig, clock: C) -> Self {
        let notifier = config.on_state_change.clone().map(|callback| {
            EventNotifier::spawn(&config.name, DEFAULT_EVENT_QUEUE, move |event: &StateChange| {
                callback(event);
            })
        });

        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                requests: 0,
                half_open_count: 0,
                expiry: None,
                last_state_change: clock.system_time(),
            }),
            config,
            notifier,
            clock,
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Active configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run a synchronous operation if the breaker admits it.
    ///
    /// Returns the operation's own result, or the admission rejection
    /// (`CircuitOpen` / `TooManyRequests`) converted into `E`.
    #[instrument(skip(self, operation), fields(name = %self.config.name))]
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + From<ResilienceError> + 'static,
    {
        let admission = self.before_request().map_err(E::from)?;
        let result = operation();
        admission.finish(&result);
        result
    }

    /// Run an async operation if the breaker admits it.
    ///
    /// The future is only created after admission. Cancellation is the
    /// operation's concern; capture a token in the closure if needed. If
    /// this future is dropped before the operation finishes (a timeout, a
    /// lost `select!`), the call is recorded as a failure.
    #[instrument(skip(self, operation), fields(name = %self.config.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + From<ResilienceError> + 'static,
    {
        let admission = self.before_request().map_err(E::from)?;
        let result = operation().await;
        admission.finish(&result);
        result
    }

    fn before_request(&self) -> Result<Admission<'_, C>, ResilienceError> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Admission::new(self)),
            CircuitState::Open => {
                if self.open_expired(&inner) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    // This caller is the first trial.
                    inner.half_open_count = 1;
                    Ok(Admission::new(self))
                } else {
                    debug!(name = %self.config.name, "circuit open, rejecting call");
                    Err(ResilienceError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_count < u64::from(self.config.max_half_open_requests) {
                    inner.half_open_count += 1;
                    Ok(Admission::new(self))
                } else {
                    debug!(name = %self.config.name, "half-open trial quota exhausted");
                    Err(ResilienceError::TooManyRequests)
                }
            }
        }
    }

    fn after_request<T, E>(&self, result: &Result<T, E>)
    where
        E: Error + 'static,
    {
        let success = match result {
            Ok(_) => true,
            Err(error) => self.config.is_successful.as_ref().is_some_and(|classify| classify(error)),
        };
        self.record(success);
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        inner.requests = inner.requests.saturating_add(1);

        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.successes += 1;
                inner.failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.failures += 1;
                if self.should_trip(&inner) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.successes += 1;
                if inner.successes >= u64::from(self.config.max_half_open_requests) {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, false) => {
                self.transition(&mut inner, CircuitState::Open);
            }
            // Late result from a call admitted before the trip.
            (CircuitState::Open, _) => {}
        }
    }

    fn should_trip(&self, inner: &BreakerState) -> bool {
        if self.config.failure_ratio > 0.0 && inner.requests >= u64::from(self.config.min_requests)
        {
            #[allow(clippy::cast_precision_loss)]
            let ratio = inner.failures as f64 / inner.requests as f64;
            return ratio >= self.config.failure_ratio;
        }
        inner.failures >= u64::from(self.config.max_failures)
    }

    fn open_expired(&self, inner: &BreakerState) -> bool {
        inner.expiry.map_or(true, |expiry| self.clock.now() >= expiry)
    }

    /// Move to `to`, resetting the counters the new state starts from.
    ///
    /// Must be called with the state lock held so events are queued in
    /// transition order.
    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.last_state_change = self.clock.system_time();
        match to {
            CircuitState::Open => {
                inner.expiry = Some(self.clock.now() + self.config.timeout);
                inner.half_open_count = 0;
                warn!(
                    name = %self.config.name,
                    %from,
                    %to,
                    failures = inner.failures,
                    requests = inner.requests,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.clear_counters();
                inner.expiry = None;
                info!(name = %self.config.name, %from, %to, "circuit breaker half-open");
            }
            CircuitState::Closed => {
                inner.clear_counters();
                inner.expiry = None;
                info!(name = %self.config.name, %from, %to, "circuit breaker closed");
            }
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify(StateChange {
                name: self.config.name.clone(),
                from,
                to,
                at: inner.last_state_change,
            });
        }
    }

    /// Current state, moving an expired `Open` breaker to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open && self.open_expired(&inner) {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }
        inner.state
    }

    /// Fast check whether a call would currently be attempted.
    ///
    /// Does not transition state or consume a half-open trial.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_expired(&inner),
            CircuitState::HalfOpen => {
                inner.half_open_count < u64::from(self.config.max_half_open_requests)
            }
        }
    }

    /// Snapshot of state and counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            requests: inner.requests,
            half_open_count: inner.half_open_count,
            last_state_change: inner.last_state_change,
        }
    }

    /// Force the breaker closed and zero all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.clear_counters();
        inner.expiry = None;
        info!(name = %self.config.name, "circuit breaker manually reset");
    }

    /// Deliver queued state-change events and stop the notifier thread.
    ///
    /// Later transitions are still applied but no longer reported.
    pub fn shutdown_events(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.shutdown();
        }
    }
}
