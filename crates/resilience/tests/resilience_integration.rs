//! Integration tests for the resilience primitives
//!
//! Exercises each primitive on real time and the full decorator stack
//! (limiter, bulkhead, breaker, retry) the way a service client composes it.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use revenge_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    RateLimiterConfig, ResilienceError, ResilienceSettings, Retry, RetryConfig,
    TokenBucketLimiter,
};

/// Error type of a downstream client
#[derive(Debug, thiserror::Error)]
enum ServiceError {
    #[error("upstream failure: {0}")]
    Upstream(&'static str),
    #[error(transparent)]
    Policy(#[from] ResilienceError),
}

impl ServiceError {
    fn policy(&self) -> Option<ResilienceError> {
        match self {
            Self::Policy(e) => Some(*e),
            Self::Upstream(_) => None,
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("revenge_resilience=debug")
        .with_test_writer()
        .try_init();
}

fn failing() -> Result<(), ServiceError> {
    Err(ServiceError::Upstream("boom"))
}

/// Validates the breaker trips and recovers on wall-clock time.
///
/// # Test Steps
/// 1. Configure breaker with 3 max failures and a 1s timeout
/// 2. Make three failing calls and verify the breaker is open
/// 3. Verify a fourth call is rejected without running the operation
/// 4. Sleep 1.1s and verify the next call is admitted as a half-open trial call
#[tokio::test]
async fn test_breaker_trips_and_recovers_after_timeout() {
    init_tracing();
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .name("tmdb")
            .max_failures(3)
            .timeout(Duration::from_secs(1))
            .build()
            .expect("valid config"),
    )
    .expect("breaker");

    for _ in 0..3 {
        assert!(matches!(breaker.call(failing), Err(ServiceError::Upstream(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let rejected = breaker.call(|| {
        invoked.fetch_add(1, Ordering::SeqCst);
        Ok::<_, ServiceError>(())
    });
    assert_eq!(rejected.expect_err("open").policy(), Some(ResilienceError::CircuitOpen));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let trial = breaker
        .execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ServiceError>(())
        })
        .await;
    assert!(trial.is_ok());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

/// Validates the bulkhead turns away exactly the overflow caller.
///
/// # Test Steps
/// 1. Configure bulkhead with 2 slots and no queue
/// 2. Start three callers that each hold a slot for 200ms
/// 3. Verify exactly one gets `BulkheadFull` and two complete
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulkhead_rejects_overflow_caller() {
    let bulkhead = Arc::new(
        Bulkhead::new(
            BulkheadConfig::builder()
                .name("radarr")
                .max_concurrent(2)
                .no_queue()
                .build()
                .expect("valid"),
        )
        .expect("bulkhead"),
    );

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, ServiceError>(())
                    })
                    .await
            })
        })
        .collect();

    let mut completed = 0;
    let mut full = 0;
    for caller in futures::future::join_all(callers).await {
        match caller.expect("task") {
            Ok(()) => completed += 1,
            Err(e) if e.policy() == Some(ResilienceError::BulkheadFull) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((completed, full), (2, 1));
    assert_eq!(bulkhead.stats().rejected, 1);
}

/// Validates fail-fast rejection does not wait.
#[tokio::test]
async fn test_bulkhead_fail_fast_is_immediate() {
    let bulkhead = Bulkhead::new(
        BulkheadConfig::builder().max_concurrent(1).no_queue().build().expect("valid"),
    )
    .expect("bulkhead");

    let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let holder = bulkhead.execute(move || async move {
        let _ = started_tx.send(());
        let _ = hold_rx.await;
        Ok::<_, ServiceError>(())
    });

    let overflow = async {
        started_rx.await.expect("holder started");
        let started = Instant::now();
        let result = bulkhead.execute(|| async { Ok::<_, ServiceError>(()) }).await;
        let elapsed = started.elapsed();
        let _ = hold_tx.send(());
        (result, elapsed)
    };

    let (held, (result, elapsed)) = tokio::join!(holder, overflow);
    assert!(held.is_ok());
    assert_eq!(result.expect_err("full").policy(), Some(ResilienceError::BulkheadFull));
    assert!(elapsed < Duration::from_millis(50), "rejection took {elapsed:?}");
}

/// Validates the token bucket refills on wall-clock time.
///
/// # Test Steps
/// 1. Configure 10 tokens/s with a burst of 10
/// 2. Drain the bucket with one `allow_n(10)`
/// 3. Verify the next request is rejected
/// 4. Sleep 150ms and verify one token is available again
#[tokio::test]
async fn test_token_bucket_refills() {
    let limiter = TokenBucketLimiter::new(
        RateLimiterConfig::builder().rate(10.0).burst(10).build().expect("valid"),
    )
    .expect("limiter");

    assert!(limiter.allow_n(10));
    assert!(!limiter.allow_n(1));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(limiter.allow_n(1));
}

/// Validates tokens never exceed the burst and debits are exact.
#[tokio::test]
async fn test_token_bucket_is_capped() {
    let limiter = TokenBucketLimiter::new(
        RateLimiterConfig::builder().rate(10.0).burst(5).build().expect("valid"),
    )
    .expect("limiter");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(limiter.available() <= 5.0);
    assert!(!limiter.allow_n(6));
    assert!(limiter.allow_n(5));
    assert!(limiter.available() < 1.0);
}

/// Validates retry stops after the configured attempts with exponential waits.
///
/// # Test Steps
/// 1. Configure 3 attempts, 10ms initial wait, multiplier 2, no jitter
/// 2. Run an operation that always fails
/// 3. Verify exactly 3 calls were made
/// 4. Verify at least 30ms elapsed (10ms + 20ms)
#[tokio::test]
async fn test_retry_exhausts_attempts() {
    let retry = Retry::new(
        RetryConfig::builder()
            .max_attempts(3)
            .initial_wait(Duration::from_millis(10))
            .multiplier(2.0)
            .no_jitter()
            .build()
            .expect("valid"),
    )
    .expect("retry");

    let calls = AtomicU32::new(0);
    let started = Instant::now();
    let result: Result<(), ServiceError> = retry
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            failing()
        })
        .await;

    assert!(matches!(result, Err(ServiceError::Upstream("boom"))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

/// Validates retry returns as soon as an attempt succeeds.
#[test]
fn test_retry_stops_on_success() {
    let retry = Retry::seeded(
        RetryConfig::builder()
            .max_attempts(5)
            .initial_wait(Duration::from_millis(1))
            .build()
            .expect("valid"),
        7,
    )
    .expect("retry");

    let mut calls = 0;
    let result = retry.call(|| {
        calls += 1;
        if calls < 2 {
            failing()
        } else {
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert_eq!(calls, 2);
}

/// Validates the full decorator stack around one client call.
///
/// # Test Steps
/// 1. Build limiter, bulkhead, breaker (2 failures) and retry (4 attempts)
/// 2. Run an operation that always fails through the stack
/// 3. Verify the breaker opened after two upstream calls
/// 4. Verify later attempts were short-circuited with `CircuitOpen`
#[tokio::test]
async fn test_composed_stack_short_circuits() {
    init_tracing();
    let limiter = TokenBucketLimiter::new(
        RateLimiterConfig::builder().name("anilist").rate(100.0).burst(10).build().expect("valid"),
    )
    .expect("limiter");
    let bulkhead = Bulkhead::new(BulkheadConfig::builder().name("anilist").build().expect("valid"))
        .expect("bulkhead");
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder().name("anilist").max_failures(2).build().expect("valid"),
    )
    .expect("breaker");
    let retry = Retry::new(
        RetryConfig::builder()
            .max_attempts(4)
            .initial_wait(Duration::from_millis(1))
            .max_wait(Duration::from_millis(5))
            .build()
            .expect("valid"),
    )
    .expect("retry");

    let upstream_calls = AtomicU32::new(0);
    let attempts = AtomicU32::new(0);
    let (limiter, bulkhead, breaker) = (&limiter, &bulkhead, &breaker);
    let (upstream_calls_ref, attempts_ref) = (&upstream_calls, &attempts);

    let result: Result<(), ServiceError> = retry
        .execute(|| async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);
            limiter.wait().await?;
            bulkhead
                .execute(|| {
                    breaker.execute(|| async {
                        upstream_calls_ref.fetch_add(1, Ordering::SeqCst);
                        failing()
                    })
                })
                .await
        })
        .await;

    assert_eq!(result.expect_err("fails").policy(), Some(ResilienceError::CircuitOpen));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(bulkhead.stats().total_executed, 4);
}

/// Validates registries hand out one shared instance per name.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registries_share_instances() {
    let registries =
        Arc::new(ResilienceSettings::default().build_registries().expect("valid defaults"));

    let lookups: Vec<_> = (0..8)
        .map(|_| {
            let registries = Arc::clone(&registries);
            tokio::spawn(async move { registries.circuit_breakers.get("sonarr") })
        })
        .collect();
    let breakers: Vec<_> = futures::future::join_all(lookups)
        .await
        .into_iter()
        .map(|b| b.expect("task"))
        .collect();
    assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(registries.circuit_breakers.len(), 1);

    let bulkhead = registries.bulkheads.get("sonarr");
    let value = bulkhead.execute(|| async { Ok::<_, ServiceError>(42) }).await;
    assert_eq!(value.expect("admitted"), 42);
    assert_eq!(registries.bulkheads.stats()[0].total_executed, 1);

    assert!(registries.rate_limiters.get("sonarr").allow());
    assert_eq!(registries.rate_limiters.names(), vec!["sonarr"]);

    registries.shutdown();
    assert!(registries.circuit_breakers.get("sonarr").is_available());
}
