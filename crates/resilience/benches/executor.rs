//! Benchmarks for PolicyExecutor
//!
//! Measures:
//! - execute() overhead for different gate combinations
//! - lookup of a registered policy vs. lazy default
//! - reload cost

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use resilience_engine::{
    BulkheadConfig, CancellationContext, Observability, Policy, PolicyExecutor, PolicyRegistry,
    RateLimitConfig,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn executor_for(policy: Policy) -> PolicyExecutor {
    let registry = PolicyRegistry::new(Observability::noop());
    registry.reload(policy).unwrap();
    PolicyExecutor::new(Arc::new(registry))
}

fn execute_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor/execute");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let policies = [
        ("passthrough", Policy::passthrough("svc")),
        ("default", Policy::new("svc")),
        (
            "all_gates",
            Policy::new("svc")
                .with_rate_limit(RateLimitConfig::new(u32::MAX, Duration::from_secs(1), u32::MAX))
                .with_bulkhead(BulkheadConfig::new(1_024, 0, Duration::from_secs(1))),
        ),
    ];

    for (label, policy) in policies {
        let executor = executor_for(policy);
        let ctx = CancellationContext::new();
        group.bench_with_input(BenchmarkId::new("success", label), &label, |b, _| {
            b.to_async(&rt).iter(|| async {
                let result = executor
                    .execute_with_result(&ctx, "svc", || async { Ok::<_, &str>(black_box(42)) })
                    .await;
                black_box(result)
            });
        });
    }

    group.finish();
}

fn registry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor/registry");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    group.bench_function("get_registered", |b| {
        let registry = PolicyRegistry::new(Observability::noop());
        registry.reload(Policy::new("known")).unwrap();
        b.iter(|| black_box(registry.get("known")));
    });

    group.bench_function("reload_new_version", |b| {
        let registry = PolicyRegistry::new(Observability::noop());
        let mut version = 0;
        b.iter(|| {
            version += 1;
            black_box(registry.reload(Policy::new("hot").with_version(version)))
        });
    });

    group.finish();
}

criterion_group!(benches, execute_overhead, registry_lookup);
criterion_main!(benches);
