//! Per-attempt timeout
//!
//! Stateless: the executor wraps every attempt in [`timeout`] using the
//! policy's [`TimeoutConfig`]. An attempt that runs out of time is dropped
//! and reported as [`ResilienceError::Timeout`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::config::{ResilienceConfig, field};
use crate::core::constants::{DEFAULT_MAX_TIMEOUT, DEFAULT_TIMEOUT};
use crate::core::{ResilienceError, ResilienceResult};
use crate::resilience_ensure;

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed for one attempt
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub default: Duration,
    /// Ceiling for per-call overrides
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_MAX_TIMEOUT)
    }
}

impl TimeoutConfig {
    /// Attempts get `default`; overrides are capped at `max`
    #[must_use]
    pub const fn new(default: Duration, max: Duration) -> Self {
        Self { default, max }
    }

    /// Config where `default` is also the ceiling
    #[must_use]
    pub const fn fixed(timeout: Duration) -> Self {
        Self::new(timeout, timeout)
    }

    /// Attempt timeout for a call that asked for `requested`
    pub fn bounded(&self, requested: Option<Duration>) -> Duration {
        requested.map_or(self.default, |requested| requested.min(self.max))
    }
}

impl ResilienceConfig for TimeoutConfig {
    const SECTION: &'static str = "timeout";

    fn validate(&self) -> ResilienceResult<()> {
        resilience_ensure!(
            !self.default.is_zero(),
            config field::<Self>("default"),
            "must be > 0"
        );
        resilience_ensure!(
            self.max >= self.default,
            config field::<Self>("max"),
            "must be >= default ({:?}), got {:?}",
            self.default,
            self.max
        );
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Run `future` for at most `duration`
pub async fn timeout<T, F>(policy: &str, duration: Duration, future: F) -> ResilienceResult<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ResilienceError::timeout(policy, duration))
}
