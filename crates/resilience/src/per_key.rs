//! Per-key token buckets (per user, per API key, per remote host).
//!
//! Buckets are created on first use from a shared template and evicted once
//! they have refilled completely, which means the key has been idle for at
//! least `burst / rate` seconds, and no caller holds a handle to them. Eviction runs on demand through
//! [`PerKeyLimiter::sweep`] or periodically on a background task started by
//! [`PerKeyLimiter::start_sweeper`]. The task is stopped by
//! [`PerKeyLimiter::close`] or when the limiter is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigResult, ResilienceError};
use crate::rate_limiter::{RateLimiterConfig, TokenBucketLimiter};
use crate::registry::NamedRegistry;

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Token bucket per key, created lazily from one template.
pub struct PerKeyLimiter<C: Clock + Clone = SystemClock> {
    template: RateLimiterConfig,
    buckets: Arc<NamedRegistry<TokenBucketLimiter<C>>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<C: Clock + Clone> fmt::Debug for PerKeyLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerKeyLimiter")
            .field("template", &self.template)
            .field("keys", &self.buckets.len())
            .field("sweeping", &self.sweeper.lock().is_some())
            .finish()
    }
}

impl PerKeyLimiter<SystemClock> {
    pub fn new(template: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(template, SystemClock)
    }
}

impl<C: Clock + Clone> PerKeyLimiter<C> {
    pub fn with_clock(template: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        template.validate()?;
        let bucket_template = template.clone();
        let buckets = NamedRegistry::new(move |key: &str| {
            TokenBucketLimiter::from_validated(bucket_template.named(key), clock.clone())
        });
        Ok(Self { template, buckets: Arc::new(buckets), sweeper: Mutex::new(None) })
    }

    /// Bucket for `key`, created on first use.
    pub fn limiter(&self, key: &str) -> Arc<TokenBucketLimiter<C>> {
        self.buckets.get(key)
    }

    pub fn allow(&self, key: &str) -> bool {
        self.limiter(key).allow()
    }

    pub fn allow_n(&self, key: &str, n: u32) -> bool {
        self.limiter(key).allow_n(n)
    }

    pub async fn wait(&self, key: &str) -> Result<(), ResilienceError> {
        self.limiter(key).wait().await
    }

    pub async fn wait_with_cancel(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ResilienceError> {
        self.limiter(key).wait_with_cancel(cancel).await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evict every bucket that is full; returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_idle(&self.buckets)
    }

    /// Start the background sweep at [`DEFAULT_SWEEP_INTERVAL`].
    pub fn start_sweeper(&self) -> bool {
        self.start_sweeper_every(DEFAULT_SWEEP_INTERVAL)
    }

    /// Start the background sweep at `interval`.
    ///
    /// Returns `false` when no tokio runtime is available. Calling it while a
    /// sweep is already running leaves the running one in place.
    pub fn start_sweeper_every(&self, interval: Duration) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return true;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(name = %self.template.name, "no tokio runtime; per-key sweep not started");
            return false;
        };

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let buckets = Arc::downgrade(&self.buckets);
        let name = self.template.name.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(buckets) = buckets.upgrade() else {
                            break;
                        };
                        let removed = sweep_idle(&buckets);
                        if removed > 0 {
                            debug!(name = %name, removed, remaining = buckets.len(), "swept idle keys");
                        }
                    }
                }
            }
            debug!(name = %name, "per-key sweep stopped");
        });

        info!(name = %self.template.name, ?period, "per-key sweep started");
        *sweeper = Some(Sweeper { cancel, handle });
        true
    }

    /// Whether a background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(|s| !s.handle.is_finished())
    }

    /// Stop the background sweep and wait for it to finish.
    pub async fn close(&self) {
        let Some(Sweeper { cancel, handle }) = self.sweeper.lock().take() else {
            return;
        };
        cancel.cancel();
        if let Err(error) = handle.await {
            warn!(name = %self.template.name, %error, "per-key sweep task failed");
        }
    }
}

impl<C: Clock + Clone> Drop for PerKeyLimiter<C> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.cancel.cancel();
        }
    }
}

// A bucket someone still holds a handle to is in use, even if it is full.
fn sweep_idle<C: Clock>(buckets: &NamedRegistry<TokenBucketLimiter<C>>) -> usize {
    buckets.retain(|bucket| Arc::strong_count(bucket) > 1 || !bucket.is_full())
}
