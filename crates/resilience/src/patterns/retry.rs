//! Retry with exponential backoff and symmetric jitter
//!
//! The delay before attempt `k` (`k >= 2`) is
//! `min(max_delay, base_delay * multiplier^(k-2))`, scaled by a uniform
//! factor in `[1 - jitter, 1 + jitter]` and floored at zero. Backoff sleeps
//! go through [`CancellationContext::sleep`], so cancellation ends the loop
//! immediately.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::config::{ResilienceConfig, field};
use crate::core::constants::DEFAULT_RETRY_ATTEMPTS;
use crate::core::{BoxError, CancellationContext, ResilienceError, ResilienceResult};
use crate::observability::{Observability, ResilienceEvent};
use crate::resilience_ensure;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay, `0.0..=1.0`
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl RetryConfig {
    /// Config with `max_attempts` and defaults for the rest
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set base and max delay
    #[must_use]
    pub const fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Set multiplier
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set jitter fraction
    #[must_use]
    pub const fn with_jitter(mut self, jitter_percent: f64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Un-jittered delay before `attempt` (1-based); zero for the first.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;
        if !scaled.is_finite() || scaled >= cap {
            self.max_delay
        } else {
            Duration::from_nanos(scaled as u64)
        }
    }
}

impl ResilienceConfig for RetryConfig {
    const SECTION: &'static str = "retry";

    fn validate(&self) -> ResilienceResult<()> {
        resilience_ensure!(
            self.max_attempts >= 1,
            config field::<Self>("max_attempts"),
            "must be >= 1, got {}",
            self.max_attempts
        );
        resilience_ensure!(
            self.multiplier.is_finite() && self.multiplier >= 1.0,
            config field::<Self>("multiplier"),
            "must be >= 1.0, got {}",
            self.multiplier
        );
        resilience_ensure!(
            (0.0..=1.0).contains(&self.jitter_percent),
            config field::<Self>("jitter_percent"),
            "must be within 0.0..=1.0, got {}",
            self.jitter_percent
        );
        resilience_ensure!(
            self.base_delay <= self.max_delay,
            config field::<Self>("base_delay"),
            "must not exceed max_delay ({:?} > {:?})",
            self.base_delay,
            self.max_delay
        );
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Decides whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

/// Statistics about one retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Attempts started
    pub attempts: u32,
    /// Total time spent in backoff
    pub total_delay: Duration,
}

/// Bounded retry loop bound to one policy
#[derive(Clone)]
pub struct RetryPolicy {
    policy: String,
    config: RetryConfig,
    predicate: RetryPredicate,
    observability: Observability,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a retry policy, validating the config.
    ///
    /// The default predicate retries everything except cancellation and
    /// configuration errors.
    pub fn new(
        policy: impl Into<String>,
        config: RetryConfig,
        observability: Observability,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            policy: policy.into(),
            config,
            predicate: Arc::new(ResilienceError::is_retryable),
            observability,
        })
    }

    /// Replace the retry predicate
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Replace the retry predicate with a shared one
    #[must_use]
    pub fn with_shared_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Bound configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered delay before `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.backoff(attempt);
        let jitter = self.config.jitter_percent;
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = (fastrand::f64().mul_add(2.0, -1.0)).mul_add(jitter, 1.0).max(0.0);
        Duration::from_nanos((base.as_nanos() as f64 * factor) as u64)
    }

    /// Whether `err` should be retried
    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        (self.predicate)(err)
    }

    /// Run `operation` with retries
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute_with_stats(ctx, operation).await.0
    }

    /// Run `operation` with retries and report loop statistics
    pub async fn execute_with_stats<T, E, F, Fut>(
        &self,
        ctx: &CancellationContext,
        mut operation: F,
    ) -> (ResilienceResult<T>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(ctx, None, |_| {
            let fut = operation();
            async move { fut.await.map_err(ResilienceError::from_operation) }
        })
        .await
    }

    /// Core loop: `attempt` receives the 1-based attempt number.
    ///
    /// `CircuitOpen` and cancellation end the loop as-is; they are never
    /// wrapped in `RetriesExhausted`. `predicate` overrides the policy's own.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        ctx: &CancellationContext,
        predicate: Option<&RetryPredicate>,
        mut attempt: F,
    ) -> (ResilienceResult<T>, RetryStats)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut stats = RetryStats::default();
        let mut current = 1;

        loop {
            if ctx.is_cancelled() {
                return (Err(ctx.error()), stats);
            }

            stats.attempts = current;
            let err = match attempt(current).await {
                Ok(value) => {
                    if current > 1 {
                        debug!(
                            policy = %self.policy,
                            attempt = current,
                            "Operation succeeded after retry"
                        );
                    }
                    return (Ok(value), stats);
                }
                Err(err) => err,
            };

            if matches!(err, ResilienceError::CircuitOpen { .. }) || err.is_cancelled() {
                return (Err(err), stats);
            }

            let retryable = match predicate {
                Some(predicate) => predicate(&err),
                None => self.is_retryable(&err),
            };
            if !retryable {
                debug!(policy = %self.policy, attempt = current, error = %err, "Error is not retryable");
                return (Err(err), stats);
            }

            if current >= max_attempts {
                warn!(
                    policy = %self.policy,
                    attempts = current,
                    error = %err,
                    "All retry attempts exhausted"
                );
                return (
                    Err(ResilienceError::RetriesExhausted {
                        attempts: current,
                        last_error: Box::new(err),
                    }),
                    stats,
                );
            }

            let next = current + 1;
            let delay = self.delay_for_attempt(next);
            debug!(
                policy = %self.policy,
                attempt = next,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after backoff"
            );
            self.observability
                .metrics()
                .record_retry_attempt(&self.policy, next);
            self.observability.emit(&ResilienceEvent::RetryScheduled {
                policy: self.policy.clone(),
                attempt: next,
                max_attempts,
                delay,
                error: err.to_string(),
            });

            if let Err(cancelled) = ctx.sleep(delay).await {
                return (Err(cancelled), stats);
            }
            stats.total_delay += delay;
            current = next;
        }
    }
}
