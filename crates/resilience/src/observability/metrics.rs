//! Execution metrics and the recorders that consume them

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::ResilienceError;
use crate::patterns::circuit_breaker::CircuitState;

/// Maximum number of policies tracked, to bound memory under name churn
const MAX_TRACKED_POLICIES: usize = 10_000;

/// Final outcome of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Operation succeeded
    Success,
    /// Operation ran and failed (including panics, exhaustion and cancellation)
    Failure,
    /// Final attempt ran out of time
    Timeout,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Rate limiter rejected the call
    RateLimited,
    /// Bulkhead queue was full
    BulkheadRejected,
    /// Bulkhead queue wait timed out
    BulkheadTimeout,
}

impl Outcome {
    /// All outcomes, in declaration order
    pub const ALL: [Self; 7] = [
        Self::Success,
        Self::Failure,
        Self::Timeout,
        Self::CircuitOpen,
        Self::RateLimited,
        Self::BulkheadRejected,
        Self::BulkheadTimeout,
    ];

    /// Outcome for a failed call
    pub fn from_error(err: &ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen { .. } => Self::CircuitOpen,
            ResilienceError::RateLimited { .. } => Self::RateLimited,
            ResilienceError::BulkheadFull { .. } => Self::BulkheadRejected,
            ResilienceError::BulkheadTimeout { .. } => Self::BulkheadTimeout,
            ResilienceError::Timeout { .. } => Self::Timeout,
            ResilienceError::RetriesExhausted { last_error, .. }
                if matches!(**last_error, ResilienceError::Timeout { .. }) =>
            {
                Self::Timeout
            }
            _ => Self::Failure,
        }
    }

    /// Label used in logs and metric names
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::BulkheadTimeout => "bulkhead_timeout",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one `execute` call, emitted exactly once per call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Policy the call ran under
    pub policy_name: String,
    /// Final outcome
    pub outcome: Outcome,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Wall time of the whole call, including queueing and backoff
    pub duration: Duration,
}

/// Sink for execution metrics
///
/// Only [`record_execution`](Self::record_execution) is mandatory; the
/// per-pattern hooks default to no-ops.
pub trait MetricsRecorder: Send + Sync {
    /// One record per `execute` call
    fn record_execution(&self, metrics: &ExecutionMetrics);

    /// Breaker entered `state`
    fn record_circuit_state(&self, _policy: &str, _state: CircuitState) {}

    /// A retry attempt (2-based) is about to run
    fn record_retry_attempt(&self, _policy: &str, _attempt: u32) {}

    /// Rate limiter decision
    fn record_rate_limit(&self, _policy: &str, _allowed: bool) {}

    /// Bulkhead queue length changed
    fn record_bulkhead_queue(&self, _policy: &str, _queued: usize) {}
}

/// Recorder that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_execution(&self, _metrics: &ExecutionMetrics) {}
}

/// Duration summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DurationStats {
    /// Number of samples
    pub count: u64,
    /// Sum of samples
    pub total: Duration,
    /// Smallest sample
    pub min: Duration,
    /// Largest sample
    pub max: Duration,
}

impl DurationStats {
    fn record(&mut self, value: Duration) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.total = self.total.saturating_add(value);
    }

    /// Mean of all samples
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

/// Point-in-time view of one policy's metrics
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyMetricsSnapshot {
    /// Executions by outcome
    pub outcomes: HashMap<Outcome, u64>,
    /// Total operation invocations across all executions
    pub attempts: u64,
    /// Retry attempts recorded
    pub retry_attempts: u64,
    /// Rate limiter admissions
    pub rate_limit_allowed: u64,
    /// Rate limiter rejections
    pub rate_limit_denied: u64,
    /// Last reported bulkhead queue length
    pub bulkhead_queued: usize,
    /// Highest reported bulkhead queue length
    pub bulkhead_queue_peak: usize,
    /// Last reported breaker state
    pub circuit_state: Option<CircuitState>,
    /// Number of breaker transitions seen
    pub circuit_transitions: u64,
    /// Execution durations
    pub duration: DurationStats,
}

impl PolicyMetricsSnapshot {
    /// Executions with the given outcome
    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Total executions
    pub fn executions(&self) -> u64 {
        self.outcomes.values().sum()
    }
}

#[derive(Debug, Default)]
struct PolicyTally {
    outcomes: [u64; Outcome::ALL.len()],
    attempts: u64,
    retry_attempts: u64,
    rate_limit_allowed: u64,
    rate_limit_denied: u64,
    bulkhead_queued: usize,
    bulkhead_queue_peak: usize,
    circuit_state: Option<CircuitState>,
    circuit_transitions: u64,
    duration: DurationStats,
}

impl PolicyTally {
    fn snapshot(&self) -> PolicyMetricsSnapshot {
        PolicyMetricsSnapshot {
            outcomes: Outcome::ALL
                .iter()
                .filter(|o| self.outcomes[o.index()] > 0)
                .map(|&o| (o, self.outcomes[o.index()]))
                .collect(),
            attempts: self.attempts,
            retry_attempts: self.retry_attempts,
            rate_limit_allowed: self.rate_limit_allowed,
            rate_limit_denied: self.rate_limit_denied,
            bulkhead_queued: self.bulkhead_queued,
            bulkhead_queue_peak: self.bulkhead_queue_peak,
            circuit_state: self.circuit_state,
            circuit_transitions: self.circuit_transitions,
            duration: self.duration,
        }
    }
}

/// In-process recorder keeping per-policy tallies
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    policies: RwLock<HashMap<String, PolicyTally>>,
}

impl InMemoryMetrics {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, policy: &str, f: impl FnOnce(&mut PolicyTally)) {
        let mut policies = self.policies.write();
        if let Some(tally) = policies.get_mut(policy) {
            f(tally);
            return;
        }
        if policies.len() >= MAX_TRACKED_POLICIES {
            return;
        }
        f(policies.entry(policy.to_string()).or_default());
    }

    /// Snapshot for one policy
    #[must_use]
    pub fn snapshot(&self, policy: &str) -> Option<PolicyMetricsSnapshot> {
        self.policies.read().get(policy).map(PolicyTally::snapshot)
    }

    /// Snapshot for every tracked policy
    #[must_use]
    pub fn all(&self) -> HashMap<String, PolicyMetricsSnapshot> {
        self.policies
            .read()
            .iter()
            .map(|(name, tally)| (name.clone(), tally.snapshot()))
            .collect()
    }

    /// Clear all metrics
    pub fn clear(&self) {
        self.policies.write().clear();
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn record_execution(&self, metrics: &ExecutionMetrics) {
        self.update(&metrics.policy_name, |t| {
            t.outcomes[metrics.outcome.index()] += 1;
            t.attempts += u64::from(metrics.attempts);
            t.duration.record(metrics.duration);
        });
    }

    fn record_circuit_state(&self, policy: &str, state: CircuitState) {
        self.update(policy, |t| {
            t.circuit_state = Some(state);
            t.circuit_transitions += 1;
        });
    }

    fn record_retry_attempt(&self, policy: &str, _attempt: u32) {
        self.update(policy, |t| t.retry_attempts += 1);
    }

    fn record_rate_limit(&self, policy: &str, allowed: bool) {
        self.update(policy, |t| {
            if allowed {
                t.rate_limit_allowed += 1;
            } else {
                t.rate_limit_denied += 1;
            }
        });
    }

    fn record_bulkhead_queue(&self, policy: &str, queued: usize) {
        self.update(policy, |t| {
            t.bulkhead_queued = queued;
            t.bulkhead_queue_peak = t.bulkhead_queue_peak.max(queued);
        });
    }
}
