//! Error types for resilience operations

use std::time::Duration;

/// Boxed error returned by protected operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core resilience errors
///
/// Variants fall into three families that callers are expected to branch on:
///
/// - **admission denied** ([`CircuitOpen`](Self::CircuitOpen),
///   [`RateLimited`](Self::RateLimited), [`BulkheadFull`](Self::BulkheadFull),
///   [`BulkheadTimeout`](Self::BulkheadTimeout)): the operation never ran;
/// - **execution failed** ([`RetriesExhausted`](Self::RetriesExhausted),
///   [`Timeout`](Self::Timeout), [`Panic`](Self::Panic),
///   [`Operation`](Self::Operation)): the operation ran and failed;
/// - **validation** ([`InvalidConfig`](Self::InvalidConfig),
///   [`StaleVersion`](Self::StaleVersion)): a policy reload was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// Circuit breaker is open
    #[error("circuit breaker for '{policy}' is open")]
    CircuitOpen {
        /// Policy that owns the breaker
        policy: String,
        /// Remaining cool-down before a probe is admitted
        retry_after: Option<Duration>,
    },

    /// Rate limit exceeded
    #[error("rate limit exceeded for '{policy}'")]
    RateLimited {
        /// Policy that owns the limiter
        policy: String,
        /// Time until enough tokens are available, if they ever can be
        retry_after: Option<Duration>,
    },

    /// Bulkhead is full and its wait queue is full too
    #[error("bulkhead for '{policy}' is full ({max_concurrent} active, {max_queue} queued)")]
    BulkheadFull {
        /// Policy that owns the bulkhead
        policy: String,
        /// Maximum concurrency limit
        max_concurrent: usize,
        /// Maximum queue length
        max_queue: usize,
    },

    /// Queued caller was not admitted within the queue timeout
    #[error("timed out after {waited:?} waiting for a bulkhead slot on '{policy}'")]
    BulkheadTimeout {
        /// Policy that owns the bulkhead
        policy: String,
        /// How long the caller waited in the queue
        waited: Duration,
    },

    /// Every allowed attempt failed
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error returned by the final attempt
        #[source]
        last_error: Box<ResilienceError>,
    },

    /// An attempt ran longer than the policy's timeout
    #[error("operation on '{policy}' timed out after {duration:?}")]
    Timeout {
        /// Policy that set the timeout
        policy: String,
        /// Time the attempt was allowed
        duration: Duration,
    },

    /// The operation panicked; the panic was caught at the attempt boundary
    #[error("operation panicked: {message}")]
    Panic {
        /// Panic payload rendered as text
        message: String,
    },

    /// Operation was cancelled or its deadline passed
    #[error("operation cancelled{}", fmt_reason(.reason))]
    Cancelled {
        /// Reason for cancellation
        reason: Option<String>,
    },

    /// Error returned by the protected operation itself
    #[error("operation failed: {0}")]
    Operation(#[source] BoxError),

    /// Invalid configuration
    #[error("invalid configuration for '{field}': {message}")]
    InvalidConfig {
        /// Offending field, dotted path from the policy root
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Reload offered an older version than the one active
    #[error("stale policy version for '{name}': offered {offered}, active {current}")]
    StaleVersion {
        /// Policy name
        name: String,
        /// Version currently active
        current: u64,
        /// Version that was offered
        offered: u64,
    },
}

fn fmt_reason(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

/// Error classification for decision making
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient errors that should be retried
    Transient,
    /// Admission was denied by a gate
    ResourceExhaustion,
    /// Configuration or programming errors
    Configuration,
    /// Permanent failures
    Permanent,
    /// Error came from the operation and carries no hint
    Unknown,
}

impl ResilienceError {
    /// Wrap an operation error.
    ///
    /// If the operation returned a `ResilienceError` itself (for example a
    /// nested executor, or an explicit `Cancelled`) it is unwrapped instead
    /// of being nested inside [`Operation`](Self::Operation).
    pub fn from_operation(err: impl Into<BoxError>) -> Self {
        match err.into().downcast::<Self>() {
            Ok(inner) => *inner,
            Err(other) => Self::Operation(other),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: Option<String>) -> Self {
        Self::Cancelled { reason }
    }

    /// Create a timeout error
    pub fn timeout(policy: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            policy: policy.into(),
            duration,
        }
    }

    /// Create a configuration error for `field`
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify the error for decision making
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::CircuitOpen { .. }
            | Self::RateLimited { .. }
            | Self::BulkheadFull { .. }
            | Self::BulkheadTimeout { .. } => ErrorClass::ResourceExhaustion,
            Self::RetriesExhausted { .. } | Self::Cancelled { .. } => ErrorClass::Permanent,
            Self::Timeout { .. } | Self::Panic { .. } => ErrorClass::Transient,
            Self::Operation(_) => ErrorClass::Unknown,
            Self::InvalidConfig { .. } | Self::StaleVersion { .. } => ErrorClass::Configuration,
        }
    }

    /// Whether the operation never ran because a gate rejected it
    pub fn is_admission_denied(&self) -> bool {
        self.classify() == ErrorClass::ResourceExhaustion
    }

    /// Whether the operation ran and failed
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. }
                | Self::Timeout { .. }
                | Self::Panic { .. }
                | Self::Operation(_)
        )
    }

    /// Whether this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Default retry classification: everything except cancellation.
    pub fn is_retryable(&self) -> bool {
        !self.is_cancelled()
    }

    /// Get retry delay hint if available
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}
