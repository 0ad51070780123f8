//! Circuit breaker
//!
//! A consecutive-failure state machine guarded by a single per-instance lock:
//!
//! - `Closed`: calls pass; `failure_threshold` consecutive failures open it.
//! - `Open`: calls fail fast until `timeout` has elapsed since opening.
//! - `HalfOpen`: at most `probe_count` probes are in flight; any probe failure
//!   reopens the breaker, `success_threshold` consecutive successes close it.
//!
//! The protected operation never runs under the lock, so admission and the
//! later verdict are two separate critical sections. [`CircuitBreaker::check`]
//! hands out an [`Admission`] that remembers which half-open period, if any,
//! the call is probing; verdicts and releases reported through it only touch
//! probe accounting of that same period.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::config::{ResilienceConfig, field};
use crate::core::constants::{
    DEFAULT_BREAKER_TIMEOUT, DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_COUNT,
    DEFAULT_SUCCESS_THRESHOLD,
};
use crate::core::{ResilienceError, ResilienceResult};
use crate::observability::{Observability, ResilienceEvent};
use crate::resilience_ensure;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - operations are allowed
    Closed,
    /// Circuit is open - operations are rejected
    Open,
    /// Circuit is half-open - limited operations are allowed for testing
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the breaker
    pub failure_threshold: u32,
    /// Consecutive probe successes in `HalfOpen` that close the breaker
    pub success_threshold: u32,
    /// Time the breaker stays open before admitting probes
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub timeout: Duration,
    /// Maximum probes in flight while half-open
    pub probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfig {
    /// Default configuration: 5 failures, 2 successes, 30s, 3 probes
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout: DEFAULT_BREAKER_TIMEOUT,
            probe_count: DEFAULT_PROBE_COUNT,
        }
    }

    /// Set failure threshold
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold
    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set open timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set half-open probe count
    #[must_use]
    pub const fn with_probe_count(mut self, probes: u32) -> Self {
        self.probe_count = probes;
        self
    }
}

impl ResilienceConfig for CircuitBreakerConfig {
    const SECTION: &'static str = "circuit_breaker";

    fn validate(&self) -> ResilienceResult<()> {
        resilience_ensure!(
            self.failure_threshold >= 1,
            config field::<Self>("failure_threshold"),
            "must be >= 1, got {}",
            self.failure_threshold
        );
        resilience_ensure!(
            self.success_threshold >= 1,
            config field::<Self>("success_threshold"),
            "must be >= 1, got {}",
            self.success_threshold
        );
        resilience_ensure!(
            self.probe_count >= 1,
            config field::<Self>("probe_count"),
            "must be >= 1, got {}",
            self.probe_count
        );
        resilience_ensure!(
            !self.timeout.is_zero(),
            config field::<Self>("timeout"),
            "must be > 0"
        );
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted in the current state
    pub consecutive_failures: u32,
    /// Consecutive successes counted in the current state
    pub consecutive_successes: u32,
    /// Probes admitted and not yet reported
    pub in_flight_probes: u32,
    /// Time since the breaker last opened, while open or half-open
    pub open_for: Option<Duration>,
    /// Failures recorded over the breaker's lifetime
    pub total_failures: u64,
    /// Successes recorded over the breaker's lifetime
    pub total_successes: u64,
    /// Requests denied over the breaker's lifetime
    pub total_rejected: u64,
}

/// Ticket for one admitted call.
///
/// Report the call's verdict with [`CircuitBreaker::record_success_of`] or
/// [`CircuitBreaker::record_failure_of`], or give it back unreported with
/// [`CircuitBreaker::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Admission {
    probe: Option<u64>,
}

impl Admission {
    /// Whether the call holds a half-open probe slot
    pub const fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    // Bumped on every entry into HalfOpen.
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    in_flight_probes: u32,
    total_failures: u64,
    total_successes: u64,
    total_rejected: u64,
}

impl BreakerInner {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            in_flight_probes: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejected: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.in_flight_probes = 0;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.generation += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.in_flight_probes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.in_flight_probes = 0;
        self.opened_at = None;
    }

    fn probe(&self) -> Admission {
        Admission {
            probe: Some(self.generation),
        }
    }

    /// Whether a report belongs to a probe of the current half-open period.
    /// Unscoped reports are taken at face value.
    fn owns_probe(&self, admission: Option<Admission>) -> bool {
        self.state == CircuitState::HalfOpen
            && admission.is_none_or(|a| a.probe == Some(self.generation))
    }
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Circuit breaker owned by one policy
pub struct CircuitBreaker {
    policy: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    observability: Observability,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker for `policy`, validating the config
    pub fn new(
        policy: impl Into<String>,
        config: CircuitBreakerConfig,
        observability: Observability,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            policy: policy.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            observability,
        })
    }

    /// Policy name
    pub fn policy(&self) -> &str {
        &self.policy
    }

    /// Bound configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of state and counters
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            in_flight_probes: inner.in_flight_probes,
            open_for: inner.opened_at.map(|t| t.elapsed()),
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejected: inner.total_rejected,
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// In `Open`, the first call after the timeout moves the breaker to
    /// `HalfOpen` and is admitted as the first probe.
    ///
    /// Verdicts for calls admitted this way go through the unscoped
    /// [`record_success`](Self::record_success) and
    /// [`record_failure`](Self::record_failure).
    pub fn allow_request(&self) -> bool {
        let (admission, transition) = {
            let mut inner = self.inner.lock();
            let (admission, transition) = self.admit(&mut inner, Instant::now());
            if admission.is_none() {
                inner.total_rejected += 1;
            }
            (admission, transition)
        };
        self.notify(transition);
        admission.is_some()
    }

    /// Admit a call, or return [`ResilienceError::CircuitOpen`] with a
    /// cool-down hint.
    pub fn check(&self) -> ResilienceResult<Admission> {
        let now = Instant::now();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let (admission, transition) = self.admit(&mut inner, now);
            let result = if let Some(admission) = admission {
                Ok(admission)
            } else {
                inner.total_rejected += 1;
                let retry_after = match inner.state {
                    CircuitState::Open => inner
                        .opened_at
                        .map(|t| self.config.timeout.saturating_sub(now - t)),
                    _ => None,
                };
                Err(ResilienceError::CircuitOpen {
                    policy: self.policy.clone(),
                    retry_after,
                })
            };
            (result, transition)
        };
        self.notify(transition);
        result
    }

    fn admit(&self, inner: &mut BreakerInner, now: Instant) -> (Option<Admission>, Transition) {
        match inner.state {
            CircuitState::Closed => (Some(Admission { probe: None }), None),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| now.duration_since(opened) >= self.config.timeout);
                if cooled {
                    inner.half_open();
                    inner.in_flight_probes = 1;
                    (
                        Some(inner.probe()),
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                } else {
                    (None, None)
                }
            }
            CircuitState::HalfOpen => {
                if inner.in_flight_probes < self.config.probe_count {
                    inner.in_flight_probes += 1;
                    (Some(inner.probe()), None)
                } else {
                    (None, None)
                }
            }
        }
    }

    /// Record a successful call admitted by [`allow_request`](Self::allow_request)
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Record a failed call admitted by [`allow_request`](Self::allow_request)
    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    /// Record the success of the call behind `admission`.
    ///
    /// A call admitted before the current half-open period counts towards
    /// the totals only.
    pub fn record_success_of(&self, admission: Admission) {
        self.on_success(Some(admission));
    }

    /// Record the failure of the call behind `admission`.
    ///
    /// A call admitted before the current half-open period counts towards
    /// the totals only.
    pub fn record_failure_of(&self, admission: Admission) {
        self.on_failure(Some(admission));
    }

    /// Give back an admission without a verdict.
    ///
    /// Used when the call was cancelled or abandoned. Frees the probe slot
    /// if `admission` holds one in the current half-open period.
    pub fn release(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.is_probe() && inner.owns_probe(Some(admission)) {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
    }

    fn on_success(&self, admission: Option<Admission>) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_successes += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if inner.owns_probe(admission) => {
                    inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.close();
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // Late report from a call admitted before the breaker opened.
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self, admission: Option<Admission>) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_successes = 0;
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.open(Instant::now());
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if inner.owns_probe(admission) => {
                    inner.consecutive_failures += 1;
                    inner.open(Instant::now());
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.close();
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => warn!(
                policy = %self.policy,
                from = %from,
                to = %to,
                action = "circuit_opened",
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                policy = %self.policy,
                from = %from,
                to = %to,
                action = "circuit_half_opened",
                "Circuit breaker admitting probes"
            ),
            CircuitState::Closed => info!(
                policy = %self.policy,
                from = %from,
                to = %to,
                action = "circuit_closed",
                "Circuit breaker closed"
            ),
        }

        self.observability
            .metrics()
            .record_circuit_state(&self.policy, to);
        self.observability
            .emit(&ResilienceEvent::CircuitStateChanged {
                policy: self.policy.clone(),
                from,
                to,
            });
    }
}
