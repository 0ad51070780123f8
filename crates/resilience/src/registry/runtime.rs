//! Per-policy runtime: the live primitives built from one policy version

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::ResilienceResult;
use crate::observability::Observability;
use crate::patterns::{Bulkhead, CircuitBreaker, RetryPolicy, TimeoutConfig, TokenBucket};
use crate::policy::{PatternConfig, Policy};

/// What a reload does with the runtime state of the previous version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStrategy {
    /// Fresh primitives: breaker closed, bucket full, empty queue
    #[default]
    Reset,
    /// Keep each primitive whose pattern config (and enabled flag) did not
    /// change; rebuild the rest
    PreserveUnchanged,
}

/// Live primitives for one policy version.
///
/// Calls in flight keep the runtime they started with alive, so a reload
/// never pulls a slot or a breaker out from under a running operation.
pub struct PolicyRuntime {
    policy: Arc<Policy>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryPolicy>,
    rate_limiter: Option<Arc<TokenBucket>>,
    bulkhead: Option<Bulkhead>,
}

impl fmt::Debug for PolicyRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRuntime")
            .field("policy", &self.policy.name)
            .field("version", &self.policy.version)
            .field("circuit_breaker", &self.circuit_breaker.is_some())
            .field("retry", &self.retry.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .field("bulkhead", &self.bulkhead.is_some())
            .finish()
    }
}

fn build<C, T>(
    pattern: &PatternConfig<C>,
    make: impl FnOnce(&C) -> ResilienceResult<T>,
) -> ResilienceResult<Option<T>> {
    pattern.active().map(make).transpose()
}

fn carry<C: PartialEq, T: Clone>(
    previous: &PatternConfig<C>,
    next: &PatternConfig<C>,
    existing: Option<&T>,
    make: impl FnOnce(&C) -> ResilienceResult<T>,
) -> ResilienceResult<Option<T>> {
    if previous == next {
        return Ok(existing.cloned());
    }
    build(next, make)
}

impl PolicyRuntime {
    /// Build fresh primitives for every enabled pattern
    pub fn build(policy: Policy, observability: &Observability) -> ResilienceResult<Self> {
        let name = policy.name.clone();
        Ok(Self {
            circuit_breaker: build(&policy.circuit_breaker, |c| {
                CircuitBreaker::new(&name, c.clone(), observability.clone()).map(Arc::new)
            })?,
            retry: build(&policy.retry, |c| {
                RetryPolicy::new(&name, c.clone(), observability.clone())
            })?,
            rate_limiter: build(&policy.rate_limit, |c| {
                TokenBucket::new(&name, c.clone(), observability.clone()).map(Arc::new)
            })?,
            bulkhead: build(&policy.bulkhead, |c| {
                Bulkhead::new(&name, c.clone(), observability.clone())
            })?,
            policy: Arc::new(policy),
        })
    }

    /// Build the runtime for `policy` as a successor of `self`
    pub fn successor(
        &self,
        policy: Policy,
        strategy: ReloadStrategy,
        observability: &Observability,
    ) -> ResilienceResult<Self> {
        if strategy == ReloadStrategy::Reset || self.policy.name != policy.name {
            return Self::build(policy, observability);
        }

        let name = policy.name.clone();
        let prev = &self.policy;
        Ok(Self {
            circuit_breaker: carry(
                &prev.circuit_breaker,
                &policy.circuit_breaker,
                self.circuit_breaker.as_ref(),
                |c| CircuitBreaker::new(&name, c.clone(), observability.clone()).map(Arc::new),
            )?,
            retry: carry(&prev.retry, &policy.retry, self.retry.as_ref(), |c| {
                RetryPolicy::new(&name, c.clone(), observability.clone())
            })?,
            rate_limiter: carry(
                &prev.rate_limit,
                &policy.rate_limit,
                self.rate_limiter.as_ref(),
                |c| TokenBucket::new(&name, c.clone(), observability.clone()).map(Arc::new),
            )?,
            bulkhead: carry(&prev.bulkhead, &policy.bulkhead, self.bulkhead.as_ref(), |c| {
                Bulkhead::new(&name, c.clone(), observability.clone())
            })?,
            policy: Arc::new(policy),
        })
    }

    /// The policy version this runtime was built from
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Circuit breaker, if enabled
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// Retry policy, if enabled
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Rate limiter, if enabled
    pub fn rate_limiter(&self) -> Option<&Arc<TokenBucket>> {
        self.rate_limiter.as_ref()
    }

    /// Bulkhead, if enabled
    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// Per-attempt timeout, if enabled
    pub fn timeout(&self) -> Option<&TimeoutConfig> {
        self.policy.timeout.active()
    }
}
