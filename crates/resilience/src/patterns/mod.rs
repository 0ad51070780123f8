//! Resilience patterns implementations

pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use rate_limiter::{
    KeyedRateLimiter, RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, TokenBucket,
};
pub use retry::{RetryConfig, RetryPolicy, RetryPredicate, RetryStats};
pub use timeout::{TimeoutConfig, timeout};
