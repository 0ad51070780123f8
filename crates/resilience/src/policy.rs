//! Named policy: the unit of configuration and hot reload
//!
//! A [`Policy`] is a fixed struct with one [`PatternConfig`] per pattern.
//! Each carries an `enabled` flag next to the pattern's settings, so a
//! disabled pattern keeps its configuration and can be re-enabled by a
//! later reload.

use serde::{Deserialize, Serialize};

use crate::core::{ResilienceConfig, ResilienceError, ResilienceResult};
use crate::patterns::{
    BulkheadConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig, TimeoutConfig,
};

/// One pattern's settings plus its on/off switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig<C> {
    /// Whether the pattern gates calls
    pub enabled: bool,
    /// Pattern settings
    #[serde(flatten)]
    pub config: C,
}

impl<C: Default> Default for PatternConfig<C> {
    fn default() -> Self {
        Self {
            enabled: false,
            config: C::default(),
        }
    }
}

impl<C> PatternConfig<C> {
    /// Enabled pattern
    pub const fn enabled(config: C) -> Self {
        Self {
            enabled: true,
            config,
        }
    }

    /// Disabled pattern that keeps its settings
    pub const fn disabled(config: C) -> Self {
        Self {
            enabled: false,
            config,
        }
    }

    /// Settings if the pattern is enabled
    pub fn active(&self) -> Option<&C> {
        self.enabled.then_some(&self.config)
    }
}

impl<C: ResilienceConfig> PatternConfig<C> {
    fn validate(&self) -> ResilienceResult<()> {
        match self.active() {
            Some(config) => config.validate(),
            None => Ok(()),
        }
    }
}

/// Named bundle of per-pattern configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Policy name, the registry key
    pub name: String,
    /// Monotonic version; reloads with a lower version are rejected
    pub version: u64,
    /// Circuit breaker
    pub circuit_breaker: PatternConfig<CircuitBreakerConfig>,
    /// Retry
    pub retry: PatternConfig<RetryConfig>,
    /// Rate limiter
    pub rate_limit: PatternConfig<RateLimitConfig>,
    /// Bulkhead
    pub bulkhead: PatternConfig<BulkheadConfig>,
    /// Per-attempt timeout
    pub timeout: PatternConfig<TimeoutConfig>,
}

impl Default for Policy {
    /// Breaker and retry enabled; rate limit, bulkhead and timeout disabled.
    ///
    /// Unconfigured callers get failure isolation but are never throttled.
    fn default() -> Self {
        Self {
            name: String::new(),
            version: 0,
            circuit_breaker: PatternConfig::enabled(CircuitBreakerConfig::default()),
            retry: PatternConfig::enabled(RetryConfig::default()),
            rate_limit: PatternConfig::disabled(RateLimitConfig::default()),
            bulkhead: PatternConfig::disabled(BulkheadConfig::default()),
            timeout: PatternConfig::disabled(TimeoutConfig::default()),
        }
    }
}

impl Policy {
    /// Default policy under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Policy with every pattern disabled: calls pass straight through
    pub fn passthrough(name: impl Into<String>) -> Self {
        let mut policy = Self::new(name);
        policy.circuit_breaker.enabled = false;
        policy.retry.enabled = false;
        policy
    }

    /// Same policy under another name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set version
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Enable the circuit breaker with `config`
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = PatternConfig::enabled(config);
        self
    }

    /// Enable retry with `config`
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = PatternConfig::enabled(config);
        self
    }

    /// Enable the rate limiter with `config`
    #[must_use]
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = PatternConfig::enabled(config);
        self
    }

    /// Enable the bulkhead with `config`
    #[must_use]
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = PatternConfig::enabled(config);
        self
    }

    /// Enable the per-attempt timeout with `config`
    #[must_use]
    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = PatternConfig::enabled(config);
        self
    }

    /// Disable the circuit breaker
    #[must_use]
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker.enabled = false;
        self
    }

    /// Disable retry
    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry.enabled = false;
        self
    }

    /// Disable the rate limiter
    #[must_use]
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit.enabled = false;
        self
    }

    /// Disable the bulkhead
    #[must_use]
    pub fn without_bulkhead(mut self) -> Self {
        self.bulkhead.enabled = false;
        self
    }

    /// Disable the timeout
    #[must_use]
    pub fn without_timeout(mut self) -> Self {
        self.timeout.enabled = false;
        self
    }

    /// Validate the name and every enabled pattern
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.name.trim().is_empty() {
            return Err(ResilienceError::invalid_config("name", "must not be empty"));
        }
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.bulkhead.validate()?;
        self.timeout.validate()?;
        Ok(())
    }
}
