//! # Resilience Engine
//!
//! Named resilience policies executed around arbitrary async operations.
//!
//! Each policy composes up to five gates:
//!
//! - **Rate limiter**: token bucket, rejects bursts above the configured rate
//! - **Bulkhead**: caps concurrent calls, with a bounded FIFO wait queue
//! - **Retry**: exponential backoff with jitter, cancellable between attempts
//! - **Circuit breaker**: fails fast while a dependency is unhealthy
//! - **Timeout**: bounds every attempt
//!
//! Policies live in a [`PolicyRegistry`] and can be hot-reloaded; the
//! [`PolicyExecutor`] looks up the current version on every call.
//!
//! ## Quick Start
//!
//! ```rust
//! use resilience_engine::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError> {
//!     let registry = Arc::new(PolicyRegistry::new(Observability::noop()));
//!     registry.reload(
//!         Policy::new("payments")
//!             .with_version(1)
//!             .with_retry(RetryConfig::new(3))
//!             .with_bulkhead(BulkheadConfig::new(8, 16, Duration::from_secs(1))),
//!     )?;
//!
//!     let executor = PolicyExecutor::new(registry);
//!     let ctx = CancellationContext::new().with_timeout(Duration::from_secs(5));
//!     let receipt = executor
//!         .execute_with_result(&ctx, "payments", || async {
//!             Ok::<_, std::io::Error>("charged")
//!         })
//!         .await?;
//!     assert_eq!(receipt, "charged");
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

// Errors, cancellation and config plumbing
pub mod core;

// Gate implementations
pub mod patterns;

// Events and metrics sinks
pub mod observability;

// Policies, the registry and the executor
pub mod executor;
pub mod policy;
pub mod registry;

pub use crate::core::{
    BoxError, CancellationContext, ErrorClass, ResilienceConfig, ResilienceError,
    ResilienceResult, ResilienceResultExt, ResultExt,
};

pub use crate::patterns::{
    Admission, Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerStats, CircuitState, KeyedRateLimiter,
    RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RetryConfig, RetryPolicy,
    RetryPredicate, RetryStats, TimeoutConfig, TokenBucket,
};

pub use crate::observability::{
    CompositeEmitter, EventEmitter, ExecutionMetrics, InMemoryMetrics, LoggingEmitter,
    MetricsRecorder, NoopEmitter, NoopMetrics, Observability, Outcome, ResilienceEvent,
};

pub use executor::PolicyExecutor;
pub use policy::{PatternConfig, Policy};
pub use registry::{
    InMemoryPolicyRepository, PolicyEvent, PolicyEventKind, PolicyRegistry, PolicyRepository,
    PolicyRuntime, RegistryConfig, ReloadOutcome, ReloadStrategy,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::core::{CancellationContext, ResilienceError, ResilienceResult};
    pub use crate::observability::{Observability, Outcome};
    pub use crate::patterns::{
        BulkheadConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig, TimeoutConfig,
    };
    pub use crate::{Policy, PolicyExecutor, PolicyRegistry, ReloadOutcome};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
