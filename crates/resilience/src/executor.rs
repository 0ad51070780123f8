//! Policy executor: runs an operation through a named policy's gates
//!
//! Gates are applied cheapest first:
//!
//! 1. rate limiter
//! 2. bulkhead (the permit is held until the call returns)
//! 3. retry loop, where every attempt asks the circuit breaker first, runs
//!    under the policy's timeout and reports its outcome afterwards
//!
//! Exactly one [`ExecutionMetrics`] record is emitted per call, whatever
//! the outcome, including calls whose future is dropped before completion.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::core::{BoxError, CancellationContext, ResilienceError, ResilienceResult};
use crate::observability::{
    ExecutionMetrics, MetricsRecorder, Observability, Outcome, ResilienceEvent,
};
use crate::patterns::{Admission, CircuitBreaker, RetryPredicate, timeout};
use crate::registry::{PolicyRegistry, PolicyRuntime};

/// Executes operations under the policies of a [`PolicyRegistry`]
#[derive(Clone)]
pub struct PolicyExecutor {
    registry: Arc<PolicyRegistry>,
    retry_predicate: Option<RetryPredicate>,
}

impl std::fmt::Debug for PolicyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyExecutor")
            .field("registry", &self.registry)
            .field("retry_predicate", &self.retry_predicate.is_some())
            .finish()
    }
}

impl PolicyExecutor {
    /// Executor over `registry`
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            retry_predicate: None,
        }
    }

    /// Decide retryability with `predicate` instead of
    /// [`ResilienceError::is_retryable`]. Cancellation is never retried.
    #[must_use]
    pub fn with_retry_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    /// Underlying registry
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Run `operation` under the policy `name`, discarding its value
    pub async fn execute<E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        name: &str,
        operation: F,
    ) -> ResilienceResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
    {
        self.call(ctx, name, None, operation).await
    }

    /// Run `operation` under the policy `name` and return its value.
    ///
    /// The closure is called once per attempt. A panic while building or
    /// polling the future becomes [`ResilienceError::Panic`] and counts as a
    /// breaker failure.
    pub async fn execute_with_result<T, E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        name: &str,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.call(ctx, name, None, operation).await
    }

    /// Like [`execute_with_result`](Self::execute_with_result) with a
    /// per-attempt timeout of `attempt_timeout`.
    ///
    /// If the policy has a timeout, the request is capped at its `max`.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        name: &str,
        attempt_timeout: Duration,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.call(ctx, name, Some(attempt_timeout), operation).await
    }

    #[tracing::instrument(skip_all, fields(policy = name))]
    async fn call<T, E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        name: &str,
        attempt_timeout: Option<Duration>,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut record = ExecutionRecord::new(self.registry.observability().metrics(), name);

        let result = match self.registry.get(name) {
            Ok(runtime) => {
                self.run(ctx, &runtime, attempt_timeout, operation, &mut record.attempts)
                    .await
            }
            Err(err) => Err(err),
        };

        record.outcome = Some(match &result {
            Ok(_) => Outcome::Success,
            Err(err) => {
                if err.is_admission_denied() {
                    debug!(error = %err, "Call not admitted");
                } else {
                    debug!(error = %err, attempts = record.attempts, "Call failed");
                }
                Outcome::from_error(err)
            }
        });
        result
    }

    async fn run<T, E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        runtime: &PolicyRuntime,
        attempt_timeout: Option<Duration>,
        mut operation: F,
        invocations: &mut u32,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let policy = runtime.policy().name.as_str();
        let observability = self.registry.observability();

        if ctx.is_cancelled() {
            return Err(ctx.error());
        }

        if let Some(limiter) = runtime.rate_limiter() {
            limiter.allow()?;
        }

        let _permit = match runtime.bulkhead() {
            Some(bulkhead) => Some(bulkhead.acquire(ctx).await?),
            None => None,
        };

        let attempt_timeout = match runtime.timeout() {
            Some(config) => Some(config.bounded(attempt_timeout)),
            None => attempt_timeout,
        };
        let breaker = runtime.circuit_breaker();
        let mut attempt = |_: u32| {
            let admitted = match breaker {
                Some(breaker) => breaker
                    .check()
                    .map(|admission| Some((Arc::clone(breaker), admission))),
                None => Ok(None),
            };
            let started = admitted.map(|admission| {
                *invocations += 1;
                let guard = AttemptGuard::new(admission);
                let call = std::panic::catch_unwind(AssertUnwindSafe(&mut operation));
                (guard, call)
            });
            attempt_outcome(policy, observability, attempt_timeout, started)
        };

        match runtime.retry() {
            Some(retry) => {
                retry
                    .run(ctx, self.retry_predicate.as_ref(), &mut attempt)
                    .await
                    .0
            }
            None => {
                if ctx.is_cancelled() {
                    return Err(ctx.error());
                }
                attempt(1).await
            }
        }
    }
}

type StartedAttempt<Fut> = (AttemptGuard, std::thread::Result<Fut>);

async fn attempt_outcome<T, E, Fut>(
    policy: &str,
    observability: &Observability,
    attempt_timeout: Option<Duration>,
    started: ResilienceResult<StartedAttempt<Fut>>,
) -> ResilienceResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let (mut guard, call) = started?;
    let polled = match call {
        Ok(future) => {
            let polled = AssertUnwindSafe(future).catch_unwind();
            match attempt_timeout {
                Some(duration) => match timeout(policy, duration, polled).await {
                    Ok(polled) => polled,
                    Err(err) => {
                        guard.failure();
                        debug!(policy, timeout = ?duration, "Attempt timed out");
                        return Err(err);
                    }
                },
                None => polled.await,
            }
        }
        Err(payload) => Err(payload),
    };

    match polled {
        Ok(Ok(value)) => {
            guard.success();
            Ok(value)
        }
        Ok(Err(err)) => {
            let err = ResilienceError::from_operation(err);
            if !err.is_cancelled() {
                guard.failure();
            }
            Err(err)
        }
        Err(payload) => {
            guard.failure();
            let message = panic_message(payload.as_ref());
            error!(policy, panic = %message, "Operation panicked");
            observability.emit(&ResilienceEvent::PanicRecovered {
                policy: policy.to_string(),
                message: message.clone(),
            });
            Err(ResilienceError::Panic { message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Breaker admission for one attempt. An attempt that ends without a
/// verdict (cancelled or dropped mid-flight) gives its admission back.
struct AttemptGuard {
    admission: Option<(Arc<CircuitBreaker>, Admission)>,
}

impl AttemptGuard {
    fn new(admission: Option<(Arc<CircuitBreaker>, Admission)>) -> Self {
        Self { admission }
    }

    fn success(&mut self) {
        if let Some((breaker, admission)) = self.admission.take() {
            breaker.record_success_of(admission);
        }
    }

    fn failure(&mut self) {
        if let Some((breaker, admission)) = self.admission.take() {
            breaker.record_failure_of(admission);
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if let Some((breaker, admission)) = self.admission.take() {
            breaker.release(admission);
        }
    }
}

/// Metrics record for one call, emitted on drop. A call dropped before it
/// settled is recorded as a failure.
struct ExecutionRecord<'a> {
    metrics: &'a dyn MetricsRecorder,
    policy: &'a str,
    started: Instant,
    attempts: u32,
    outcome: Option<Outcome>,
}

impl<'a> ExecutionRecord<'a> {
    fn new(metrics: &'a dyn MetricsRecorder, policy: &'a str) -> Self {
        Self {
            metrics,
            policy,
            started: Instant::now(),
            attempts: 0,
            outcome: None,
        }
    }
}

impl Drop for ExecutionRecord<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or_else(|| {
            debug!(policy = self.policy, attempts = self.attempts, "Call dropped before completion");
            Outcome::Failure
        });
        self.metrics.record_execution(&ExecutionMetrics {
            policy_name: self.policy.to_string(),
            outcome,
            attempts: self.attempts,
            duration: self.started.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::InMemoryMetrics;
    use crate::patterns::{CircuitBreakerConfig, CircuitState, RateLimitConfig, RetryConfig};
    use crate::policy::Policy;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn executor(policy: Policy) -> (PolicyExecutor, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let registry = PolicyRegistry::new(Observability::noop().with_metrics(metrics.clone()));
        registry.reload(policy).unwrap();
        (PolicyExecutor::new(Arc::new(registry)), metrics)
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_without_retry_returns_raw_error() {
        let (executor, metrics) = executor(Policy::new("raw").without_retry());
        let err = executor
            .execute(&CancellationContext::new(), "raw", || async {
                Err::<(), _>("boom")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Operation(_)));
        let snap = metrics.snapshot("raw").unwrap();
        assert_eq!(snap.count(Outcome::Failure), 1);
        assert_eq!(snap.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_operation_is_not_a_breaker_failure() {
        let policy = Policy::new("svc")
            .without_retry()
            .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(1));
        let (executor, _) = executor(policy);
        let ctx = CancellationContext::new();

        let err = executor
            .execute(&ctx, "svc", || async {
                Err::<(), _>(ResilienceError::cancelled(Some("client went away".into())))
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        let runtime = executor.registry().get("svc").unwrap();
        let breaker = runtime.circuit_breaker().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_returns_its_probe() {
        let policy = Policy::new("svc").without_retry().with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_secs(1))
                .with_probe_count(1),
        );
        let (executor, _) = executor(policy);
        let ctx = CancellationContext::new();
        let _ = executor
            .execute(&ctx, "svc", || async { Err::<(), _>("down") })
            .await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let pending = executor.execute(&ctx, "svc", || std::future::pending::<Result<(), &str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        let value = executor
            .execute_with_result(&ctx, "svc", || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn call_admitted_while_closed_cannot_free_a_probe() {
        let policy = Policy::new("svc").without_retry().with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_secs(1))
                .with_probe_count(1),
        );
        let (executor, _) = executor(policy);
        let ctx = CancellationContext::new();

        let mut slow = Box::pin(executor.execute(&ctx, "svc", || {
            std::future::pending::<Result<(), &str>>()
        }));
        assert!(futures::poll!(&mut slow).is_pending());

        let _ = executor
            .execute(&ctx, "svc", || async { Err::<(), _>("down") })
            .await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let mut probe = Box::pin(executor.execute(&ctx, "svc", || {
            std::future::pending::<Result<(), &str>>()
        }));
        assert!(futures::poll!(&mut probe).is_pending());

        drop(slow);
        let err = executor
            .execute(&ctx, "svc", || async { Ok::<_, &str>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));

        drop(probe);
        assert!(executor
            .execute(&ctx, "svc", || async { Ok::<_, &str>(()) })
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_is_still_recorded() {
        let (executor, metrics) = executor(Policy::new("svc").without_retry());
        let ctx = CancellationContext::new();
        let pending = executor.execute(&ctx, "svc", || {
            std::future::pending::<Result<(), &str>>()
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), pending)
            .await
            .is_err());

        let snap = metrics.snapshot("svc").unwrap();
        assert_eq!(snap.executions(), 1);
        assert_eq!(snap.count(Outcome::Failure), 1);
        assert_eq!(snap.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_spends_no_tokens() {
        let policy = Policy::new("svc")
            .without_retry()
            .with_rate_limit(RateLimitConfig::new(1, Duration::from_secs(3600), 1));
        let (executor, metrics) = executor(policy);
        let cancelled = CancellationContext::new();
        cancelled.cancel();

        let err = executor
            .execute(&cancelled, "svc", || async { Ok::<_, &str>(()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        executor
            .execute(&CancellationContext::new(), "svc", || async { Ok::<_, &str>(()) })
            .await
            .unwrap();
        let snap = metrics.snapshot("svc").unwrap();
        assert_eq!(snap.rate_limit_allowed, 1);
        assert_eq!(snap.rate_limit_denied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_stops_retrying() {
        let policy = Policy::new("svc").with_retry(
            RetryConfig::new(5).with_delays(Duration::from_millis(1), Duration::from_millis(1)),
        );
        let (executor, metrics) = executor(policy);
        let executor = executor.with_retry_predicate(|err| !err.to_string().contains("400"));

        let err = executor
            .execute(&CancellationContext::new(), "svc", || async {
                Err::<(), _>("HTTP 400")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Operation(_)));
        assert_eq!(metrics.snapshot("svc").unwrap().attempts, 1);
    }
}
