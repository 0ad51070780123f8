//! Integration tests for gate composition in `PolicyExecutor`
//!
//! - Circuit breaker trips and probes
//! - Retry counts and exhaustion
//! - Panic recovery
//! - Per-attempt timeouts
//! - Bulkhead queueing order
//! - One metrics record per call

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use resilience_engine::prelude::*;
use resilience_engine::{CircuitState, EventEmitter, InMemoryMetrics, ResilienceEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

fn executor_with(policy: Policy) -> (PolicyExecutor, Arc<InMemoryMetrics>) {
    let metrics = Arc::new(InMemoryMetrics::new());
    let registry = PolicyRegistry::new(Observability::noop().with_metrics(metrics.clone()));
    registry.reload(policy).unwrap();
    (PolicyExecutor::new(Arc::new(registry)), metrics)
}

fn quick_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::new(max_attempts)
        .with_delays(Duration::from_millis(10), Duration::from_millis(100))
        .with_jitter(0.0)
}

/// Fails on the first two invocations, succeeds afterwards
fn flaky(calls: &Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<u32, &'static str>> {
    let calls = Arc::clone(calls);
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::future::ready(if n <= 2 { Err("flaky") } else { Ok(n) })
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
struct Recorder(Mutex<Vec<ResilienceEvent>>);

impl EventEmitter for Recorder {
    fn emit(&self, event: &ResilienceEvent) {
        self.0.lock().push(event.clone());
    }
}

/// Test: the sixth call after five failures is rejected without running
#[tokio::test(start_paused = true)]
async fn test_breaker_rejects_after_failure_threshold() {
    let policy = Policy::new("inventory")
        .without_retry()
        .with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(5)
                .with_timeout(Duration::from_secs(30)),
        );
    let (executor, metrics) = executor_with(policy);
    let ctx = CancellationContext::new();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let calls = Arc::clone(&calls);
        let result = executor
            .execute(&ctx, "inventory", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("connection refused") }
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));
    }

    let counter = Arc::clone(&calls);
    let err = executor
        .execute(&ctx, "inventory", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, &str>(()) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let snap = metrics.snapshot("inventory").unwrap();
    assert_eq!(snap.count(Outcome::Failure), 5);
    assert_eq!(snap.count(Outcome::CircuitOpen), 1);
    assert_eq!(snap.attempts, 5);
    assert_eq!(snap.circuit_state, Some(CircuitState::Open));
}

/// Test: two successful probes close the breaker again
#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_probes() {
    let policy = Policy::new("search").without_retry().with_circuit_breaker(
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_timeout(Duration::from_secs(1)),
    );
    let (executor, _) = executor_with(policy);
    let ctx = CancellationContext::new();

    let _ = executor
        .execute(&ctx, "search", || async { Err::<(), _>("timeout") })
        .await;
    tokio::time::advance(Duration::from_secs(1)).await;

    for _ in 0..2 {
        executor
            .execute(&ctx, "search", || async { Ok::<_, &str>(()) })
            .await
            .unwrap();
    }

    let runtime = executor.registry().get("search").unwrap();
    let stats = runtime.circuit_breaker().unwrap().stats();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.consecutive_successes, 0);
}

/// Test: retry succeeds on the third invocation with five attempts allowed
#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_on_third_attempt() {
    let (executor, metrics) =
        executor_with(Policy::new("orders").with_retry(quick_retry(5)));
    let calls = Arc::new(AtomicU32::new(0));

    let value = executor
        .execute_with_result(&CancellationContext::new(), "orders", flaky(&calls))
        .await
        .unwrap();

    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let snap = metrics.snapshot("orders").unwrap();
    assert_eq!(snap.count(Outcome::Success), 1);
    assert_eq!(snap.attempts, 3);
    assert_eq!(snap.retry_attempts, 2);
}

/// Test: two attempts are not enough and the last error is kept
#[tokio::test(start_paused = true)]
async fn test_retry_exhausted_after_max_attempts() {
    let (executor, metrics) =
        executor_with(Policy::new("orders").with_retry(quick_retry(2)));
    let calls = Arc::new(AtomicU32::new(0));

    let err = executor
        .execute_with_result(&CancellationContext::new(), "orders", flaky(&calls))
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match err {
        ResilienceError::RetriesExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(last_error.to_string(), "operation failed: flaky");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(metrics.snapshot("orders").unwrap().count(Outcome::Failure), 1);
}

/// Test: a breaker that opens mid-retry ends the loop with CircuitOpen
#[tokio::test(start_paused = true)]
async fn test_breaker_opening_stops_retry_loop() {
    let policy = Policy::new("ledger")
        .with_retry(quick_retry(5))
        .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(2));
    let (executor, metrics) = executor_with(policy);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let err = executor
        .execute(&CancellationContext::new(), "ledger", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("unavailable") }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snap = metrics.snapshot("ledger").unwrap();
    assert_eq!(snap.count(Outcome::CircuitOpen), 1);
    assert_eq!(snap.attempts, 2);
}

/// Test: a deadline interrupts the backoff sleep
#[tokio::test(start_paused = true)]
async fn test_deadline_interrupts_backoff() {
    let retry = RetryConfig::new(10)
        .with_delays(Duration::from_secs(5), Duration::from_secs(5))
        .with_jitter(0.0);
    let (executor, _) = executor_with(Policy::new("slow").with_retry(retry));
    let ctx = CancellationContext::new().with_timeout(Duration::from_millis(50));

    let started = tokio::time::Instant::now();
    let err = executor
        .execute(&ctx, "slow", || async { Err::<(), _>("busy") })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.to_string(), "operation cancelled: deadline exceeded");
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Test: panics are recovered, reported and release the bulkhead slot
#[tokio::test(start_paused = true)]
async fn test_panic_is_recovered_and_releases_slot() {
    let events = Arc::new(Recorder::default());
    let metrics = Arc::new(InMemoryMetrics::new());
    let registry = PolicyRegistry::new(
        Observability::noop()
            .with_events(events.clone())
            .with_metrics(metrics.clone()),
    );
    registry
        .reload(
            Policy::new("render")
                .without_retry()
                .with_bulkhead(BulkheadConfig::new(1, 0, Duration::from_secs(1))),
        )
        .unwrap();
    let executor = PolicyExecutor::new(Arc::new(registry));
    let ctx = CancellationContext::new();

    async fn explode() -> Result<(), &'static str> {
        panic!("template missing")
    }
    let err = executor.execute(&ctx, "render", explode).await.unwrap_err();
    match err {
        ResilienceError::Panic { message } => assert_eq!(message, "template missing"),
        other => panic!("unexpected error: {other}"),
    }

    fn eager() -> std::future::Ready<Result<(), &'static str>> {
        panic!("failed before the first poll")
    }
    let err = executor.execute(&ctx, "render", eager).await.unwrap_err();
    assert!(matches!(err, ResilienceError::Panic { .. }));

    let runtime = executor.registry().get("render").unwrap();
    assert_eq!(runtime.bulkhead().unwrap().stats().active, 0);
    executor
        .execute(&ctx, "render", || async { Ok::<_, &str>(()) })
        .await
        .unwrap();

    let recovered = events
        .0
        .lock()
        .iter()
        .filter(|e| matches!(e, ResilienceEvent::PanicRecovered { .. }))
        .count();
    assert_eq!(recovered, 2);
    let breaker = runtime.circuit_breaker().unwrap().stats();
    assert_eq!(breaker.total_failures, 2);
    assert_eq!(metrics.snapshot("render").unwrap().executions(), 3);
}

/// Test: with every pattern disabled the call goes straight through
#[tokio::test]
async fn test_disabled_patterns_always_admit() {
    let (executor, metrics) = executor_with(Policy::passthrough("raw"));
    let ctx = CancellationContext::new();

    for i in 0..50 {
        let value = executor
            .execute_with_result(&ctx, "raw", move || async move { Ok::<_, &str>(i) })
            .await
            .unwrap();
        assert_eq!(value, i);
    }

    let runtime = executor.registry().get("raw").unwrap();
    assert!(runtime.circuit_breaker().is_none());
    assert!(runtime.rate_limiter().is_none());
    assert!(runtime.bulkhead().is_none());
    assert!(runtime.retry().is_none());
    assert_eq!(metrics.snapshot("raw").unwrap().count(Outcome::Success), 50);
}

/// Test: every call yields exactly one metrics record, including rejections
#[tokio::test(start_paused = true)]
async fn test_one_metrics_record_per_call() {
    let policy = Policy::new("api")
        .without_retry()
        .with_rate_limit(RateLimitConfig::new(2, Duration::from_secs(3600), 2));
    let (executor, metrics) = executor_with(policy);
    let ctx = CancellationContext::new();
    let calls = Arc::new(AtomicU32::new(0));

    let mut rejected = 0;
    for _ in 0..5 {
        let calls = Arc::clone(&calls);
        let result = executor
            .execute(&ctx, "api", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(()) }
            })
            .await;
        if let Err(err) = result {
            assert!(matches!(err, ResilienceError::RateLimited { .. }));
            assert!(err.retry_after().is_some());
            rejected += 1;
        }
    }

    assert_eq!(rejected, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snap = metrics.snapshot("api").unwrap();
    assert_eq!(snap.executions(), 5);
    assert_eq!(snap.count(Outcome::Success), 2);
    assert_eq!(snap.count(Outcome::RateLimited), 3);
    assert_eq!(snap.attempts, 2);
    assert_eq!(snap.rate_limit_denied, 3);
}

/// Test: bulkhead of two with a queue of one admits in arrival order
#[tokio::test(start_paused = true)]
async fn test_bulkhead_queue_is_fifo() {
    let policy = Policy::new("db")
        .without_retry()
        .with_bulkhead(BulkheadConfig::new(2, 1, Duration::from_secs(60)));
    let (executor, metrics) = executor_with(policy);
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));

    let spawn_call = |label: &'static str| {
        let executor = executor.clone();
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            executor
                .execute(&CancellationContext::new(), "db", move || {
                    let gate = Arc::clone(&gate);
                    let started = Arc::clone(&started);
                    async move {
                        started.lock().push(label);
                        let permit = gate.acquire().await.map_err(|e| e.to_string())?;
                        permit.forget();
                        Ok::<_, String>(())
                    }
                })
                .await
        })
    };

    let runtime = executor.registry().get("db").unwrap();
    let bulkhead = runtime.bulkhead().unwrap().clone();

    let first = spawn_call("first");
    let second = spawn_call("second");
    wait_until(|| bulkhead.stats().active == 2).await;
    let third = spawn_call("third");
    wait_until(|| bulkhead.stats().queued == 1).await;

    let err = executor
        .execute(&CancellationContext::new(), "db", || async { Ok::<_, &str>(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ResilienceError::BulkheadFull {
            max_concurrent: 2,
            max_queue: 1,
            ..
        }
    ));

    gate.add_permits(1);
    wait_until(|| started.lock().len() == 3).await;
    let fourth = spawn_call("fourth");
    wait_until(|| bulkhead.stats().queued == 1).await;
    assert_eq!(started.lock().as_slice(), &["first", "second", "third"]);

    gate.add_permits(3);
    for handle in [first, second, third, fourth] {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(started.lock().last(), Some(&"fourth"));

    let snap = metrics.snapshot("db").unwrap();
    assert_eq!(snap.count(Outcome::Success), 4);
    assert_eq!(snap.count(Outcome::BulkheadRejected), 1);
    assert_eq!(snap.bulkhead_queue_peak, 1);
}

/// Test: a queued caller gives up after the queue timeout
#[tokio::test(start_paused = true)]
async fn test_bulkhead_queue_timeout() {
    let policy = Policy::new("db")
        .without_retry()
        .with_bulkhead(BulkheadConfig::new(1, 1, Duration::from_millis(200)));
    let (executor, metrics) = executor_with(policy);
    let gate = Arc::new(Semaphore::new(0));

    let holder = {
        let executor = executor.clone();
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            executor
                .execute(&CancellationContext::new(), "db", move || {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
                        Ok::<_, String>(())
                    }
                })
                .await
        })
    };
    let runtime = executor.registry().get("db").unwrap();
    wait_until(|| runtime.bulkhead().unwrap().stats().active == 1).await;

    let err = executor
        .execute(&CancellationContext::new(), "db", || async { Ok::<_, &str>(()) })
        .await
        .unwrap_err();
    match err {
        ResilienceError::BulkheadTimeout { waited, .. } => {
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("unexpected error: {other}"),
    }

    gate.add_permits(1);
    holder.await.unwrap().unwrap();
    let snap = metrics.snapshot("db").unwrap();
    assert_eq!(snap.count(Outcome::BulkheadTimeout), 1);
    assert_eq!(snap.count(Outcome::Success), 1);
}

/// Test: a timed-out attempt is dropped and retried
#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_is_retried() {
    let policy = Policy::new("slow")
        .with_retry(quick_retry(3))
        .with_timeout(TimeoutConfig::fixed(Duration::from_millis(50)));
    let (executor, metrics) = executor_with(policy);
    let calls = Arc::new(AtomicU32::new(0));

    let value = executor
        .execute_with_result(&CancellationContext::new(), "slow", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok::<_, &str>(n)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 2);
    let snap = metrics.snapshot("slow").unwrap();
    assert_eq!(snap.count(Outcome::Success), 1);
    assert_eq!(snap.attempts, 2);
}

/// Test: timeouts count as breaker failures
#[tokio::test(start_paused = true)]
async fn test_timeouts_trip_the_breaker() {
    let policy = Policy::new("hung")
        .without_retry()
        .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(2))
        .with_timeout(TimeoutConfig::fixed(Duration::from_millis(20)));
    let (executor, metrics) = executor_with(policy);
    let ctx = CancellationContext::new();
    let hang = || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, &str>(())
    };

    for _ in 0..2 {
        let err = executor.execute(&ctx, "hung", hang).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Timeout { duration, .. } if duration == Duration::from_millis(20)));
    }
    let err = executor.execute(&ctx, "hung", hang).await.unwrap_err();
    assert!(matches!(err, ResilienceError::CircuitOpen { .. }));

    let runtime = executor.registry().get("hung").unwrap();
    assert_eq!(runtime.circuit_breaker().unwrap().state(), CircuitState::Open);
    let snap = metrics.snapshot("hung").unwrap();
    assert_eq!(snap.count(Outcome::Timeout), 2);
    assert_eq!(snap.count(Outcome::CircuitOpen), 1);
}

/// Test: per-call timeouts are capped by the policy
#[tokio::test(start_paused = true)]
async fn test_requested_timeout_is_capped_by_policy() {
    let policy = Policy::new("capped")
        .without_retry()
        .with_timeout(TimeoutConfig::new(Duration::from_millis(10), Duration::from_millis(100)));
    let (executor, _) = executor_with(policy);
    let registry = executor.registry();
    registry.reload(Policy::passthrough("open")).unwrap();
    let ctx = CancellationContext::new();
    let slow = || async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok::<_, &str>("late")
    };

    let err = executor
        .execute_with_timeout(&ctx, "capped", Duration::from_secs(1), slow)
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::Timeout { duration, .. } if duration == Duration::from_millis(100)));

    let err = executor
        .execute_with_timeout(&ctx, "open", Duration::from_millis(50), slow)
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::Timeout { duration, .. } if duration == Duration::from_millis(50)));

    let value = executor
        .execute_with_timeout(&ctx, "open", Duration::from_secs(1), slow)
        .await
        .unwrap();
    assert_eq!(value, "late");
}
