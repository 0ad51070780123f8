//! Core types shared by every pattern
//!
//! Error types, the result alias, cancellation and the configuration trait.

pub mod cancellation;
pub mod config;
mod error;
mod result;

pub use cancellation::CancellationContext;
pub use config::ResilienceConfig;
pub use error::{BoxError, ErrorClass, ResilienceError};
pub use result::{ResilienceResult, ResilienceResultExt, ResultExt};

/// Core constants
pub mod constants {
    use std::time::Duration;

    /// Default circuit breaker failure threshold
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

    /// Default circuit breaker success threshold
    pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

    /// Default circuit breaker open timeout
    pub const DEFAULT_BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default half-open probe count
    pub const DEFAULT_PROBE_COUNT: u32 = 3;

    /// Default retry attempts
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

    /// Default rate limit (tokens per window)
    pub const DEFAULT_RATE_LIMIT: u32 = 100;

    /// Default rate limit window
    pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

    /// Default rate limit burst
    pub const DEFAULT_BURST_SIZE: u32 = 10;

    /// Default per-attempt timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default ceiling for per-call timeout overrides
    pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(60);

    /// Default bulkhead concurrency
    pub const DEFAULT_MAX_CONCURRENT: usize = 10;
}
