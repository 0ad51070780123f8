//! Walk-through of the policy engine: breaker, retry, hot reload and metrics
//!
//! Run with `RUST_LOG=debug` to see every gate decision.

use resilience_engine::prelude::*;
use resilience_engine::{
    CompositeEmitter, InMemoryMetrics, InMemoryPolicyRepository, LoggingEmitter,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let metrics = Arc::new(InMemoryMetrics::new());
    let events = CompositeEmitter::new().with(Arc::new(LoggingEmitter::new()));
    let registry = Arc::new(PolicyRegistry::new(Observability::new(
        Arc::new(events),
        metrics.clone(),
    )));
    let executor = PolicyExecutor::new(Arc::clone(&registry));
    let ctx = CancellationContext::with_reason("demo finished");

    println!("=== Resilience Engine Demo ===\n");

    // 1. Retry: fails twice, succeeds on the third attempt
    registry.reload(
        Policy::new("inventory").with_version(1).with_retry(
            RetryConfig::new(5).with_delays(Duration::from_millis(20), Duration::from_millis(200)),
        ),
    )?;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let stock = executor
        .execute_with_result(&ctx, "inventory", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("replica {n} unavailable"))
                } else {
                    Ok(42)
                }
            }
        })
        .await?;
    println!("1. Retry: stock = {stock} after {} calls\n", calls.load(Ordering::SeqCst));

    // 2. Circuit breaker: five failures open it, the sixth call is rejected
    registry.reload(
        Policy::new("payments")
            .with_version(1)
            .without_retry()
            .with_circuit_breaker(CircuitBreakerConfig::new().with_timeout(Duration::from_secs(1))),
    )?;
    for i in 1..=6 {
        let result = executor
            .execute(&ctx, "payments", || async { Err::<(), _>("gateway timeout") })
            .await;
        println!("2. Breaker call {i}: {result:?}");
    }
    println!();

    // 3. Hot reload from a repository feed
    let repository = Arc::new(InMemoryPolicyRepository::new());
    let watcher = {
        let registry = Arc::clone(&registry);
        let repository = Arc::clone(&repository);
        let ctx = ctx.child();
        tokio::spawn(async move { registry.watch(repository.as_ref(), &ctx).await })
    };
    repository.upsert(
        Policy::new("search")
            .with_rate_limit(RateLimitConfig::new(2, Duration::from_secs(1), 2)),
    )?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    for i in 1..=3 {
        let result = executor
            .execute(&ctx, "search", || async { Ok::<_, &str>(()) })
            .await;
        println!("3. Rate limited call {i}: {result:?}");
    }
    ctx.cancel();
    println!("   watcher applied {} events\n", watcher.await?);

    // 4. Metrics
    println!("4. Metrics");
    let mut all: Vec<_> = metrics.all().into_iter().collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    for (policy, snapshot) in all {
        println!(
            "   {policy}: executions={} attempts={} mean={:?}",
            snapshot.executions(),
            snapshot.attempts,
            snapshot.duration.mean()
        );
        for outcome in Outcome::ALL {
            let count = snapshot.count(outcome);
            if count > 0 {
                println!("     {outcome}: {count}");
            }
        }
    }

    Ok(())
}
