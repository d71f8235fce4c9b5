//! Resilience hot-path benchmarks
//!
//! Measures the per-call overhead of breakers, bulkheads, token buckets,
//! registry lookups and backoff calculation.
//!
//! Run with: `cargo bench --bench resilience_bench -p revenge-resilience`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use revenge_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    MockClock, RateLimiterConfig, ResilienceError, Retry, RetryConfig, TokenBucketLimiter,
};
use tokio::runtime::Builder as RuntimeBuilder;

#[derive(Debug, thiserror::Error)]
enum BenchError {
    #[error("benchmark failure")]
    Failed,
    #[error(transparent)]
    Policy(#[from] ResilienceError),
}

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("call_success", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
            .expect("default breaker config is valid");
        b.iter(|| {
            let result: Result<(), BenchError> = breaker.call(|| Ok(()));
            black_box(result).expect("closed breaker admits calls");
        });
    });

    group.bench_function("call_rejected_open", |b| {
        let breaker = CircuitBreaker::builder()
            .max_failures(1)
            .timeout(Duration::from_secs(3600))
            .clock(MockClock::new())
            .build()
            .expect("valid breaker config");
        let _ = breaker.call(|| Err::<(), _>(BenchError::Failed));
        b.iter(|| {
            let result: Result<(), BenchError> = breaker.call(|| Ok(()));
            black_box(result.is_err());
        });
    });

    group.bench_function("trip_and_reset", |b| {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::builder().max_failures(5).build().expect("valid config"),
        )
        .expect("breaker");
        b.iter(|| {
            for _ in 0..5 {
                let _ = black_box(breaker.call(|| Err::<(), _>(BenchError::Failed)));
            }
            black_box(breaker.state());
            breaker.reset();
        });
    });

    group.finish();
}

// ============================================================================
// Bulkhead Benchmarks
// ============================================================================

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");
    let runtime = RuntimeBuilder::new_current_thread()
        .enable_time()
        .build()
        .expect("benchmark runtime");

    group.bench_function("execute_uncontended", |b| {
        let bulkhead = Bulkhead::new(BulkheadConfig::default()).expect("bulkhead");
        b.to_async(&runtime).iter(|| async {
            let result: Result<u32, BenchError> = bulkhead.execute(|| async { Ok(1) }).await;
            black_box(result).expect("free slot");
        });
    });

    group.finish();
}

// ============================================================================
// Rate Limiter Benchmarks
// ============================================================================

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");

    for burst in [1_u32, 100, 10_000] {
        group.bench_with_input(BenchmarkId::new("allow", burst), &burst, |b, &burst| {
            let limiter = TokenBucketLimiter::new(
                RateLimiterConfig::builder().rate(1e9).burst(burst).build().expect("valid"),
            )
            .expect("limiter");
            b.iter(|| black_box(limiter.allow()));
        });
    }

    group.finish();
}

// ============================================================================
// Registry Benchmarks
// ============================================================================

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).expect("registry");
    for name in ["tmdb", "tvdb", "anilist", "radarr", "sonarr"] {
        registry.get(name);
    }

    group.bench_function("get_existing", |b| {
        b.iter(|| black_box(registry.get(black_box("radarr"))));
    });

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_retry_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");

    for attempts in [3_u32, 10, 50] {
        let retry = Retry::seeded(
            RetryConfig::builder().max_attempts(attempts).build().expect("valid"),
            42,
        )
        .expect("retry");
        group.bench_with_input(BenchmarkId::new("schedule", attempts), &retry, |b, retry| {
            b.iter(|| black_box(retry.backoff().sum::<Duration>()));
        });
    }

    group.finish();
}

criterion_group!(
    resilience,
    bench_circuit_breaker,
    bench_bulkhead,
    bench_token_bucket,
    bench_registry,
    bench_retry_backoff
);
criterion_main!(resilience);
