//! Bulkhead pattern for limiting concurrent operations
//!
//! A bulkhead caps how many operations may run against one dependency at the
//! same time. Callers beyond the cap may queue for a slot (bounded by
//! `queue_size`, for at most `max_wait`), otherwise they are rejected
//! immediately. Slots are tokio semaphore permits, so the concurrency bound
//! holds without any bookkeeping lock.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError};
use crate::notify::{EventNotifier, OnReject, Rejection, DEFAULT_EVENT_QUEUE};

/// Configuration for bulkhead behavior
#[derive(Clone)]
pub struct BulkheadConfig {
    /// Name reported in logs, stats and rejection events.
    pub name: String,
    /// Maximum number of concurrent operations allowed
    pub max_concurrent: usize,
    /// Maximum number of callers waiting for a slot; `0` disables queueing
    pub queue_size: usize,
    /// How long a queued caller waits for a slot; zero disables waiting
    pub max_wait: Duration,
    /// Callback for every rejection, delivered in order off the call path
    pub on_reject: Option<OnReject>,
}

impl fmt::Debug for BulkheadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadConfig")
            .field("name", &self.name)
            .field("max_concurrent", &self.max_concurrent)
            .field("queue_size", &self.queue_size)
            .field("max_wait", &self.max_wait)
            .field("on_reject", &self.on_reject.is_some())
            .finish()
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 10,
            queue_size: 10,
            max_wait: Duration::from_secs(5),
            on_reject: None,
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration builder
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid("max_concurrent exceeds the semaphore limit"));
        }
        Ok(())
    }

    /// Copy of this configuration under another name.
    pub fn named(&self, name: &str) -> Self {
        Self { name: name.to_string(), ..self.clone() }
    }
}

/// Builder for BulkheadConfig
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.queue_size = size;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait = wait;
        self
    }

    /// Reject immediately instead of queueing.
    pub fn no_queue(mut self) -> Self {
        self.config.queue_size = 0;
        self.config.max_wait = Duration::ZERO;
        self
    }

    pub fn on_reject<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Rejection) + Send + Sync + 'static,
    {
        self.config.on_reject = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    pub name: String,
    pub max_concurrent: usize,
    /// Slots currently held
    pub active: usize,
    /// Callers queued for a slot
    pub waiting: usize,
    /// Free slots
    pub available: usize,
    pub total_executed: u64,
    /// Rejections because no slot and no queue position was free
    pub rejected: u64,
    /// Rejections after waiting `max_wait`
    pub timed_out: u64,
}

impl BulkheadStats {
    /// Fraction of slots in use (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        self.active as f64 / self.max_concurrent as f64
    }

    /// Fraction of attempts that were turned away (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        let turned_away = self.rejected + self.timed_out;
        let total = self.total_executed + turned_away;
        if total == 0 {
            return 0.0;
        }
        turned_away as f64 / total as f64
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.active >= self.max_concurrent
    }
}

/// Releases a reserved queue position when the wait ends, however it ends.
struct QueuePosition<'a>(&'a AtomicUsize);

impl Drop for QueuePosition<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bulkhead for limiting concurrent operations
///
/// # Examples
///
/// ```rust
/// use revenge_resilience::{Bulkhead, BulkheadConfig, ResilienceError};
///
/// #[derive(Debug, thiserror::Error)]
/// enum FetchError {
///     #[error("upstream failed")]
///     Upstream,
///     #[error(transparent)]
///     Policy(#[from] ResilienceError),
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = Bulkhead::new(BulkheadConfig::builder().max_concurrent(5).build()?)?;
///
/// let body = bulkhead.execute(|| async { Ok::<_, FetchError>("payload") }).await?;
/// assert_eq!(body, "payload");
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Semaphore,
    waiting: AtomicUsize,
    total_executed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    notifier: Option<EventNotifier<Rejection>>,
}

impl Bulkhead {
    /// Create a new bulkhead with the given configuration
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(config: BulkheadConfig) -> Self {
        let notifier = config.on_reject.clone().map(|callback| {
            EventNotifier::spawn(&config.name, DEFAULT_EVENT_QUEUE, move |event: &Rejection| {
                callback(event);
            })
        });

        Self {
            semaphore: Semaphore::new(config.max_concurrent),
            waiting: AtomicUsize::new(0),
            total_executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            notifier,
            config,
        }
    }

    /// Bulkhead name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Active configuration.
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Run `operation` once a slot is available.
    ///
    /// Rejections (`BulkheadFull`, `BulkheadTimeout`) are converted into `E`;
    /// the operation's own error is returned unchanged.
    #[instrument(skip(self, operation), fields(name = %self.config.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let _permit = self.acquire(None).await.map_err(E::from)?;
        self.total_executed.fetch_add(1, Ordering::Relaxed);
        operation().await
    }

    /// Like [`execute`](Self::execute), but a queued caller gives up with
    /// `Cancelled` as soon as `cancel` fires.
    #[instrument(skip(self, cancel, operation), fields(name = %self.config.name))]
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let _permit = self.acquire(Some(cancel)).await.map_err(E::from)?;
        self.total_executed.fetch_add(1, Ordering::Relaxed);
        operation().await
    }

    async fn acquire(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<SemaphorePermit<'_>, ResilienceError> {
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(permit);
        }

        if self.config.queue_size == 0 || self.config.max_wait.is_zero() {
            return Err(self.reject(ResilienceError::BulkheadFull));
        }

        let Some(_position) = self.reserve_position() else {
            return Err(self.reject(ResilienceError::BulkheadFull));
        };

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => {
                debug!(name = %self.config.name, "bulkhead wait cancelled");
                Err(ResilienceError::Cancelled)
            }
            acquired = tokio::time::timeout(self.config.max_wait, self.semaphore.acquire()) => {
                match acquired {
                    Ok(Ok(permit)) => Ok(permit),
                    // The semaphore is never closed.
                    Ok(Err(_)) => Err(self.reject(ResilienceError::BulkheadFull)),
                    Err(_) => Err(self.reject(ResilienceError::BulkheadTimeout)),
                }
            }
        }
    }

    fn reserve_position(&self) -> Option<QueuePosition<'_>> {
        let limit = self.config.queue_size;
        self.waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| (w < limit).then_some(w + 1))
            .ok()
            .map(|_| QueuePosition(&self.waiting))
    }

    fn reject(&self, reason: ResilienceError) -> ResilienceError {
        match reason {
            ResilienceError::BulkheadTimeout => self.timed_out.fetch_add(1, Ordering::Relaxed),
            _ => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
        warn!(
            name = %self.config.name,
            reason = reason.as_str(),
            active = self.active(),
            waiting = self.waiting.load(Ordering::Acquire),
            "bulkhead rejected operation"
        );
        if let Some(notifier) = &self.notifier {
            notifier.notify(Rejection { name: self.config.name.clone(), reason });
        }
        reason
    }

    fn active(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Snapshot of slot usage and counters.
    pub fn stats(&self) -> BulkheadStats {
        let available = self.semaphore.available_permits();
        BulkheadStats {
            name: self.config.name.clone(),
            max_concurrent: self.config.max_concurrent,
            active: self.config.max_concurrent.saturating_sub(available),
            waiting: self.waiting.load(Ordering::Acquire),
            available,
            total_executed: self.total_executed.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Acquire),
            timed_out: self.timed_out.load(Ordering::Acquire),
        }
    }

    /// Deliver queued rejection events and stop the notifier thread.
    pub fn shutdown_events(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.shutdown();
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.config.name)
            .field("max_concurrent", &self.config.max_concurrent)
            .field("queue_size", &self.config.queue_size)
            .field("active", &self.active())
            .field("waiting", &self.waiting.load(Ordering::Acquire))
            .finish()
    }
}
