//! Lifecycle events and the emitters that consume them

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::patterns::circuit_breaker::CircuitState;

/// Log level for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Lifecycle event raised by a pattern or by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// Circuit breaker changed state
    CircuitStateChanged {
        /// Policy that owns the breaker
        policy: String,
        /// Old state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// An attempt failed and another one is scheduled
    RetryScheduled {
        /// Policy name
        policy: String,
        /// Number of the attempt about to run (2-based)
        attempt: u32,
        /// Total attempts allowed
        max_attempts: u32,
        /// Backoff before the attempt
        delay: Duration,
        /// Error of the failed attempt
        error: String,
    },
    /// Rate limiter rejected a call
    RateLimited {
        /// Policy name
        policy: String,
        /// Hint until tokens are available
        retry_after: Option<Duration>,
    },
    /// Bulkhead rejected a call because the queue was full
    BulkheadRejected {
        /// Policy name
        policy: String,
        /// Operations running when rejected
        active: usize,
        /// Callers waiting when rejected
        queued: usize,
    },
    /// Queued caller gave up after the queue timeout
    BulkheadTimeout {
        /// Policy name
        policy: String,
        /// Time spent in the queue
        waited: Duration,
    },
    /// Operation panicked and the panic was recovered
    PanicRecovered {
        /// Policy name
        policy: String,
        /// Panic payload
        message: String,
    },
    /// Registry swapped in a new policy version
    PolicyReloaded {
        /// Policy name
        policy: String,
        /// New version
        version: u64,
    },
    /// Registry dropped a policy
    PolicyRemoved {
        /// Policy name
        policy: String,
    },
}

impl ResilienceEvent {
    /// Policy the event belongs to
    pub fn policy(&self) -> &str {
        match self {
            Self::CircuitStateChanged { policy, .. }
            | Self::RetryScheduled { policy, .. }
            | Self::RateLimited { policy, .. }
            | Self::BulkheadRejected { policy, .. }
            | Self::BulkheadTimeout { policy, .. }
            | Self::PanicRecovered { policy, .. }
            | Self::PolicyReloaded { policy, .. }
            | Self::PolicyRemoved { policy } => policy,
        }
    }

    /// Stable event kind for routing and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitStateChanged { .. } => "state_change",
            Self::RetryScheduled { .. } => "retry",
            Self::RateLimited { .. } => "rate_limited",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::BulkheadTimeout { .. } => "bulkhead_timeout",
            Self::PanicRecovered { .. } => "panic_recovered",
            Self::PolicyReloaded { .. } => "policy_reloaded",
            Self::PolicyRemoved { .. } => "policy_removed",
        }
    }

    /// Default log level.
    ///
    /// Admission denials are expected traffic and stay at debug.
    pub fn default_log_level(&self) -> LogLevel {
        match self {
            Self::CircuitStateChanged {
                to: CircuitState::Open,
                ..
            }
            | Self::PanicRecovered { .. } => LogLevel::Warn,
            Self::CircuitStateChanged { .. }
            | Self::PolicyReloaded { .. }
            | Self::PolicyRemoved { .. } => LogLevel::Info,
            Self::RetryScheduled { .. }
            | Self::RateLimited { .. }
            | Self::BulkheadRejected { .. }
            | Self::BulkheadTimeout { .. } => LogLevel::Debug,
        }
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitStateChanged { policy, from, to } => {
                write!(f, "[{policy}] circuit breaker {from} -> {to}")
            }
            Self::RetryScheduled {
                policy,
                attempt,
                max_attempts,
                delay,
                error,
            } => write!(
                f,
                "[{policy}] retrying (attempt {attempt}/{max_attempts}) in {delay:?} after: {error}"
            ),
            Self::RateLimited {
                policy,
                retry_after,
            } => match retry_after {
                Some(after) => write!(f, "[{policy}] rate limited, retry after {after:?}"),
                None => write!(f, "[{policy}] rate limited"),
            },
            Self::BulkheadRejected {
                policy,
                active,
                queued,
            } => write!(
                f,
                "[{policy}] bulkhead rejected call ({active} active, {queued} queued)"
            ),
            Self::BulkheadTimeout { policy, waited } => {
                write!(f, "[{policy}] bulkhead queue wait timed out after {waited:?}")
            }
            Self::PanicRecovered { policy, message } => {
                write!(f, "[{policy}] recovered panic: {message}")
            }
            Self::PolicyReloaded { policy, version } => {
                write!(f, "[{policy}] policy reloaded at version {version}")
            }
            Self::PolicyRemoved { policy } => write!(f, "[{policy}] policy removed"),
        }
    }
}

/// Sink for lifecycle events
///
/// Called synchronously on the hot path after the emitting primitive has
/// released its lock; implementations should hand off anything slow.
pub trait EventEmitter: Send + Sync {
    /// Called when an event occurs
    fn emit(&self, event: &ResilienceEvent);
}

/// Emitter that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: &ResilienceEvent) {}
}

/// Emitter that writes events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmitter {
    level: Option<LogLevel>,
}

impl LoggingEmitter {
    /// Log each event at its own default level
    #[must_use]
    pub fn new() -> Self {
        Self { level: None }
    }

    /// Log every event at a fixed level
    #[must_use]
    pub fn with_level(level: LogLevel) -> Self {
        Self { level: Some(level) }
    }
}

impl EventEmitter for LoggingEmitter {
    fn emit(&self, event: &ResilienceEvent) {
        let level = self.level.unwrap_or_else(|| event.default_log_level());
        let policy = event.policy();
        let kind = event.kind();
        match level {
            LogLevel::Error => tracing::error!(policy, kind, "{event}"),
            LogLevel::Warn => tracing::warn!(policy, kind, "{event}"),
            LogLevel::Info => tracing::info!(policy, kind, "{event}"),
            LogLevel::Debug => tracing::debug!(policy, kind, "{event}"),
            LogLevel::Trace => tracing::trace!(policy, kind, "{event}"),
        }
    }
}

/// Fan-out to several emitters
#[derive(Clone, Default)]
pub struct CompositeEmitter {
    emitters: Vec<Arc<dyn EventEmitter>>,
}

impl CompositeEmitter {
    /// Create an empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an emitter
    #[must_use]
    pub fn with(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitters.push(emitter);
        self
    }

    /// Number of registered emitters
    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    /// Whether no emitter is registered
    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }
}

impl fmt::Debug for CompositeEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeEmitter")
            .field("emitters", &self.emitters.len())
            .finish()
    }
}

impl EventEmitter for CompositeEmitter {
    fn emit(&self, event: &ResilienceEvent) {
        for emitter in &self.emitters {
            emitter.emit(event);
        }
    }
}
