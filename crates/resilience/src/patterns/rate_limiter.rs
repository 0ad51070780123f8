//! Token bucket rate limiter
//!
//! Tokens refill lazily on every access at `limit / window` tokens per second
//! up to `burst_size`; no background task is involved. A bucket starts full.
//! The refill-check-take sequence runs under one lock per bucket.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::{ResilienceConfig, field};
use crate::core::constants::{DEFAULT_BURST_SIZE, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW};
use crate::core::{ResilienceError, ResilienceResult};
use crate::observability::{Observability, ResilienceEvent};
use crate::resilience_ensure;

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Continuous refill up to a burst cap
    #[default]
    TokenBucket,
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Algorithm
    pub algorithm: RateLimitAlgorithm,
    /// Tokens added per window
    pub limit: u32,
    /// Refill window
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub window: Duration,
    /// Bucket capacity
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limit: DEFAULT_RATE_LIMIT,
            window: DEFAULT_RATE_WINDOW,
            burst_size: DEFAULT_BURST_SIZE,
        }
    }
}

impl RateLimitConfig {
    /// `limit` tokens per `window` with a bucket of `burst_size`
    #[must_use]
    pub fn new(limit: u32, window: Duration, burst_size: u32) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limit,
            window,
            burst_size,
        }
    }

    /// Refill rate in tokens per second
    pub fn tokens_per_second(&self) -> f64 {
        f64::from(self.limit) / self.window.as_secs_f64()
    }
}

impl ResilienceConfig for RateLimitConfig {
    const SECTION: &'static str = "rate_limit";

    fn validate(&self) -> ResilienceResult<()> {
        resilience_ensure!(
            self.limit > 0,
            config field::<Self>("limit"),
            "must be > 0, got {}",
            self.limit
        );
        resilience_ensure!(
            !self.window.is_zero(),
            config field::<Self>("window"),
            "must be > 0"
        );
        resilience_ensure!(
            self.burst_size >= 1,
            config field::<Self>("burst_size"),
            "must be >= 1, got {}",
            self.burst_size
        );
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Outcome of a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the tokens were taken
    pub allowed: bool,
    /// Whole tokens left after the decision
    pub remaining: u32,
    /// Configured tokens per window
    pub limit: u32,
    /// Time until the request could succeed; `None` when allowed or when the
    /// request exceeds the bucket capacity
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.burst_size),
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let burst = f64::from(config.burst_size);
        self.tokens = elapsed
            .as_secs_f64()
            .mul_add(config.tokens_per_second(), self.tokens)
            .min(burst);
        self.last_refill = now;
    }

    fn take(&mut self, config: &RateLimitConfig, n: u32, now: Instant) -> RateLimitDecision {
        self.refill(config, now);
        let wanted = f64::from(n);
        let allowed = self.tokens >= wanted;
        if allowed {
            self.tokens -= wanted;
        }

        let retry_after = if allowed || n > config.burst_size {
            None
        } else {
            Duration::try_from_secs_f64((wanted - self.tokens) / config.tokens_per_second()).ok()
        };

        RateLimitDecision {
            allowed,
            remaining: self.tokens.floor() as u32,
            limit: config.limit,
            retry_after,
        }
    }
}

/// Token bucket owned by one policy
pub struct TokenBucket {
    policy: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    observability: Observability,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("tokens", &self.bucket.lock().tokens)
            .finish()
    }
}

impl TokenBucket {
    /// Create a full bucket, validating the config
    pub fn new(
        policy: impl Into<String>,
        config: RateLimitConfig,
        observability: Observability,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            policy: policy.into(),
            bucket: Mutex::new(Bucket::full(&config, Instant::now())),
            config,
            observability,
        })
    }

    /// Bound configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token
    pub fn allow(&self) -> ResilienceResult<()> {
        self.allow_n(1)
    }

    /// Take `n` tokens atomically, or none
    pub fn allow_n(&self, n: u32) -> ResilienceResult<()> {
        let decision = self.try_acquire(n);
        self.observability
            .metrics()
            .record_rate_limit(&self.policy, decision.allowed);
        if decision.allowed {
            return Ok(());
        }

        debug!(
            policy = %self.policy,
            requested = n,
            remaining = decision.remaining,
            "Rate limit exceeded"
        );
        self.observability.emit(&ResilienceEvent::RateLimited {
            policy: self.policy.clone(),
            retry_after: decision.retry_after,
        });
        Err(ResilienceError::RateLimited {
            policy: self.policy.clone(),
            retry_after: decision.retry_after,
        })
    }

    /// Take `n` tokens and report the full decision, without emitting
    /// events or metrics
    pub fn try_acquire(&self, n: u32) -> RateLimitDecision {
        self.bucket.lock().take(&self.config, n, Instant::now())
    }

    /// Tokens currently available, after refill
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(&self.config, Instant::now());
        bucket.tokens
    }
}

/// One token bucket per key, for multi-tenant limits under one policy
pub struct KeyedRateLimiter<K>
where
    K: Eq + Hash,
{
    policy: String,
    config: RateLimitConfig,
    buckets: DashMap<K, Bucket>,
    observability: Observability,
}

impl<K> fmt::Debug for KeyedRateLimiter<K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedRateLimiter")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("keys", &self.buckets.len())
            .finish()
    }
}

impl<K> KeyedRateLimiter<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Create an empty limiter, validating the config
    pub fn new(
        policy: impl Into<String>,
        config: RateLimitConfig,
        observability: Observability,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            policy: policy.into(),
            config,
            buckets: DashMap::new(),
            observability,
        })
    }

    /// Take one token from `key`'s bucket
    pub fn allow(&self, key: &K) -> ResilienceResult<()> {
        self.allow_n(key, 1)
    }

    /// Take `n` tokens from `key`'s bucket
    pub fn allow_n(&self, key: &K, n: u32) -> ResilienceResult<()> {
        let decision = self.try_acquire(key, n);
        self.observability
            .metrics()
            .record_rate_limit(&self.policy, decision.allowed);
        if decision.allowed {
            return Ok(());
        }
        debug!(policy = %self.policy, key = %key, requested = n, "Rate limit exceeded");
        self.observability.emit(&ResilienceEvent::RateLimited {
            policy: self.policy.clone(),
            retry_after: decision.retry_after,
        });
        Err(ResilienceError::RateLimited {
            policy: self.policy.clone(),
            retry_after: decision.retry_after,
        })
    }

    /// Take `n` tokens from `key`'s bucket and report the decision
    pub fn try_acquire(&self, key: &K, n: u32) -> RateLimitDecision {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(&self.config, now));
        bucket.take(&self.config, n, now)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets that have refilled completely; they behave exactly like
    /// fresh ones. Returns the number of keys removed.
    pub fn prune_full(&self) -> usize {
        let now = Instant::now();
        let burst = f64::from(self.config.burst_size);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(&self.config, now);
            bucket.tokens < burst
        });
        before.saturating_sub(self.buckets.len())
    }
}
