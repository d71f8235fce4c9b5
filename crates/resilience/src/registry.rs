//! Named, lazily created primitives.
//!
//! [`NamedRegistry`] is the one place that implements "look up by name,
//! create on first use": a read-locked fast path, then a write-locked
//! double-checked insert. The breaker, bulkhead and rate limiter registries
//! are thin wrappers that supply a factory built from a validated defaults
//! template with the name overridden per entry. Entries are never removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::clock::SystemClock;
use crate::error::ConfigResult;
use crate::rate_limiter::{RateLimiterConfig, RateLimiterStats, TokenBucketLimiter};

type Factory<T> = Box<dyn Fn(&str) -> T + Send + Sync>;

/// Name-keyed singletons built on demand by a factory.
pub struct NamedRegistry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
    factory: Factory<T>,
}

impl<T> fmt::Debug for NamedRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedRegistry").field("names", &self.names()).finish()
    }
}

impl<T> NamedRegistry<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Self { entries: RwLock::new(HashMap::new()), factory: Box::new(factory) }
    }

    /// Instance registered under `name`, created on first request.
    ///
    /// Concurrent first requests for the same name all receive the same
    /// instance.
    pub fn get(&self, name: &str) -> Arc<T> {
        if let Some(existing) = self.entries.read().get(name) {
            return Arc::clone(existing);
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            return Arc::clone(existing);
        }
        debug!(name, "creating registry entry");
        let created = Arc::new((self.factory)(name));
        entries.insert(name.to_string(), Arc::clone(&created));
        created
    }

    /// Instance registered under `name`, without creating one.
    pub fn get_existing(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().get(name).cloned()
    }

    /// Apply `f` to every entry, sorted by name.
    ///
    /// The registry lock is released before `f` runs.
    pub fn snapshot<R>(&self, mut f: impl FnMut(&T) -> R) -> Vec<(String, R)> {
        let mut entries: Vec<(String, Arc<T>)> = self
            .entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(name, entry)| {
                let value = f(&entry);
                (name, value)
            })
            .collect()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop entries for which `keep` returns false; returns how many went.
    ///
    /// `keep` runs under the write lock, so no new handle can be handed out
    /// while it decides. Only keyed limiters evict. The named service
    /// registries never do.
    pub(crate) fn retain(&self, mut keep: impl FnMut(&Arc<T>) -> bool) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| keep(entry));
        before - entries.len()
    }
}

/// One circuit breaker per downstream service.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: NamedRegistry<CircuitBreaker>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.breakers)
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> ConfigResult<Self> {
        defaults.validate()?;
        let template = defaults.clone();
        let breakers = NamedRegistry::new(move |name: &str| {
            CircuitBreaker::from_validated(template.named(name), SystemClock)
        });
        Ok(Self { defaults, breakers })
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(name)
    }

    /// Stats of every breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.snapshot(CircuitBreaker::stats).into_iter().map(|(_, s)| s).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.names()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Drain and stop the event notifier of every breaker.
    pub fn shutdown(&self) {
        self.breakers.snapshot(CircuitBreaker::shutdown_events);
    }
}

/// One bulkhead per downstream service.
#[derive(Debug)]
pub struct BulkheadRegistry {
    defaults: BulkheadConfig,
    bulkheads: NamedRegistry<Bulkhead>,
}

impl BulkheadRegistry {
    pub fn new(defaults: BulkheadConfig) -> ConfigResult<Self> {
        defaults.validate()?;
        let template = defaults.clone();
        let bulkheads =
            NamedRegistry::new(move |name: &str| Bulkhead::from_validated(template.named(name)));
        Ok(Self { defaults, bulkheads })
    }

    pub fn get(&self, name: &str) -> Arc<Bulkhead> {
        self.bulkheads.get(name)
    }

    /// Stats of every bulkhead, sorted by name.
    pub fn stats(&self) -> Vec<BulkheadStats> {
        self.bulkheads.snapshot(Bulkhead::stats).into_iter().map(|(_, s)| s).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.bulkheads.names()
    }

    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }

    pub fn defaults(&self) -> &BulkheadConfig {
        &self.defaults
    }

    /// Drain and stop the event notifier of every bulkhead.
    pub fn shutdown(&self) {
        self.bulkheads.snapshot(Bulkhead::shutdown_events);
    }
}

/// One token bucket per downstream service.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    defaults: RateLimiterConfig,
    limiters: NamedRegistry<TokenBucketLimiter>,
}

impl RateLimiterRegistry {
    pub fn new(defaults: RateLimiterConfig) -> ConfigResult<Self> {
        defaults.validate()?;
        let template = defaults.clone();
        let limiters = NamedRegistry::new(move |name: &str| {
            TokenBucketLimiter::from_validated(template.named(name), SystemClock)
        });
        Ok(Self { defaults, limiters })
    }

    pub fn get(&self, name: &str) -> Arc<TokenBucketLimiter> {
        self.limiters.get(name)
    }

    /// Stats of every limiter, sorted by name.
    pub fn stats(&self) -> Vec<RateLimiterStats> {
        self.limiters.snapshot(TokenBucketLimiter::stats).into_iter().map(|(_, s)| s).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.limiters.names()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn defaults(&self) -> &RateLimiterConfig {
        &self.defaults
    }
}
