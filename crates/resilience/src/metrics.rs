//! Prometheus export for breakers, bulkheads and rate limiters.
//!
//! Events are pushed through the callback hooks; gauges that describe current
//! state are refreshed from registry snapshots with the `record_*` methods.

use std::sync::Arc;

use prometheus::{GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::bulkhead::BulkheadStats;
use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};
use crate::notify::{OnReject, OnStateChange, Rejection, StateChange};
use crate::rate_limiter::RateLimiterStats;

/// Prometheus metrics exporter for resilience primitives
#[derive(Debug, Clone)]
pub struct ResilienceMetrics {
    /// Counter for circuit breaker transitions
    transitions: IntCounterVec,
    /// Gauge for circuit breaker state (0=closed, 1=open, 2=half-open)
    breaker_state: IntGaugeVec,
    /// Counter for calls turned away, by reason
    rejections: IntCounterVec,
    /// Gauge for bulkhead slots in use
    bulkhead_active: IntGaugeVec,
    /// Gauge for tokens left in each bucket
    available_tokens: GaugeVec,
}

fn state_value(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

impl ResilienceMetrics {
    /// Create the vectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let transitions = IntCounterVec::new(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Total number of circuit breaker state transitions",
            ),
            &["name", "from", "to"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Current state of circuit breaker (0=closed, 1=open, 2=half-open)",
            ),
            &["name"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new("resilience_rejections_total", "Total number of rejected calls"),
            &["name", "reason"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let bulkhead_active = IntGaugeVec::new(
            Opts::new("bulkhead_active", "Bulkhead slots currently in use"),
            &["name"],
        )?;
        registry.register(Box::new(bulkhead_active.clone()))?;

        let available_tokens = GaugeVec::new(
            Opts::new("rate_limiter_available_tokens", "Tokens available in the bucket"),
            &["name"],
        )?;
        registry.register(Box::new(available_tokens.clone()))?;

        Ok(Self { transitions, breaker_state, rejections, bulkhead_active, available_tokens })
    }

    /// Record one breaker transition
    pub fn record_state_change(&self, change: &StateChange) {
        self.transitions
            .with_label_values(&[change.name.as_str(), change.from.as_str(), change.to.as_str()])
            .inc();
        self.breaker_state.with_label_values(&[change.name.as_str()]).set(state_value(change.to));
    }

    /// Record one rejection
    pub fn record_rejection(&self, rejection: &Rejection) {
        self.rejections
            .with_label_values(&[rejection.name.as_str(), rejection.reason.as_str()])
            .inc();
    }

    /// Callback for `CircuitBreakerConfig::on_state_change`
    pub fn state_change_hook(&self) -> OnStateChange {
        let metrics = self.clone();
        Arc::new(move |change: &StateChange| metrics.record_state_change(change))
    }

    /// Callback for `BulkheadConfig::on_reject`
    pub fn rejection_hook(&self) -> OnReject {
        let metrics = self.clone();
        Arc::new(move |rejection: &Rejection| metrics.record_rejection(rejection))
    }

    pub fn record_circuit_breaker_stats(&self, stats: &[CircuitBreakerStats]) {
        for s in stats {
            self.breaker_state.with_label_values(&[s.name.as_str()]).set(state_value(s.state));
        }
    }

    pub fn record_bulkhead_stats(&self, stats: &[BulkheadStats]) {
        for s in stats {
            let active = i64::try_from(s.active).unwrap_or(i64::MAX);
            self.bulkhead_active.with_label_values(&[s.name.as_str()]).set(active);
        }
    }

    pub fn record_rate_limiter_stats(&self, stats: &[RateLimiterStats]) {
        for s in stats {
            self.available_tokens.with_label_values(&[s.name.as_str()]).set(s.available);
        }
    }
}
