//! Integration tests for token bucket timing

use resilience_engine::prelude::*;
use resilience_engine::{InMemoryMetrics, KeyedRateLimiter, TokenBucket};
use std::sync::Arc;
use std::time::Duration;

fn per_second_bucket() -> TokenBucket {
    TokenBucket::new(
        "api",
        RateLimitConfig::new(10, Duration::from_secs(1), 10),
        Observability::noop(),
    )
    .unwrap()
}

/// Test: burst of ten, then refill on the wall clock
#[tokio::test]
async fn test_burst_then_refill_in_real_time() {
    let bucket = per_second_bucket();

    for i in 0..10 {
        assert!(bucket.allow().is_ok(), "call {i} should be admitted");
    }
    let err = bucket.allow().unwrap_err();
    assert!(matches!(err, ResilienceError::RateLimited { .. }));
    let hint = err.retry_after().unwrap();
    assert!(hint <= Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(bucket.allow().is_ok());
}

/// Test: refill is proportional to elapsed time
#[tokio::test(start_paused = true)]
async fn test_refill_rate_with_paused_clock() {
    let bucket = per_second_bucket();
    let decision = bucket.try_acquire(10);
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 0);

    tokio::time::advance(Duration::from_millis(350)).await;
    assert!(bucket.try_acquire(3).allowed);
    assert!(!bucket.try_acquire(1).allowed);

    tokio::time::advance(Duration::from_secs(10)).await;
    let decision = bucket.try_acquire(0);
    assert_eq!(decision.remaining, 10);
}

/// Test: executor surfaces the limiter's retry hint
#[tokio::test(start_paused = true)]
async fn test_executor_reports_rate_limit_hint() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let registry = PolicyRegistry::new(Observability::noop().with_metrics(metrics.clone()));
    registry
        .reload(
            Policy::new("api")
                .with_rate_limit(RateLimitConfig::new(10, Duration::from_secs(1), 10)),
        )
        .unwrap();
    let executor = PolicyExecutor::new(Arc::new(registry));
    let ctx = CancellationContext::new();

    for _ in 0..10 {
        executor
            .execute(&ctx, "api", || async { Ok::<_, &str>(()) })
            .await
            .unwrap();
    }
    let err = executor
        .execute(&ctx, "api", || async { Ok::<_, &str>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_millis(100)));

    tokio::time::advance(Duration::from_millis(100)).await;
    executor
        .execute(&ctx, "api", || async { Ok::<_, &str>(()) })
        .await
        .unwrap();

    let snap = metrics.snapshot("api").unwrap();
    assert_eq!(snap.rate_limit_allowed, 11);
    assert_eq!(snap.rate_limit_denied, 1);
}

/// Test: keyed limiter isolates tenants
#[tokio::test(start_paused = true)]
async fn test_keyed_limiter_isolates_keys() {
    let limiter: KeyedRateLimiter<String> = KeyedRateLimiter::new(
        "tenants",
        RateLimitConfig::new(2, Duration::from_secs(1), 2),
        Observability::noop(),
    )
    .unwrap();
    let acme = "acme".to_string();
    let globex = "globex".to_string();

    assert!(limiter.allow(&acme).is_ok());
    assert!(limiter.allow(&acme).is_ok());
    assert!(limiter.allow(&acme).is_err());
    assert!(limiter.allow(&globex).is_ok());
    assert_eq!(limiter.len(), 2);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(limiter.prune_full(), 2);
    assert!(limiter.is_empty());
}
