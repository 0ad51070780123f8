//! Bulkhead: bounded concurrency with a bounded FIFO wait queue
//!
//! Callers are admitted while fewer than `max_concurrent` hold a slot.
//! Otherwise they wait in arrival order, up to `max_queue` of them, for at most
//! `queue_timeout`; beyond that they are rejected without blocking.
//!
//! A released slot is handed directly to the head waiter, so a newcomer can
//! never overtake someone already queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::{ResilienceConfig, field};
use crate::core::constants::DEFAULT_MAX_CONCURRENT;
use crate::core::{CancellationContext, ResilienceError, ResilienceResult};
use crate::observability::{Observability, ResilienceEvent};
use crate::resilience_ensure;

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum operations running at once
    pub max_concurrent: usize,
    /// Maximum callers waiting for a slot; 0 disables queueing
    pub max_queue: usize,
    /// Longest time a caller may wait in the queue
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queue: 0,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl BulkheadConfig {
    /// Create a config
    #[must_use]
    pub const fn new(max_concurrent: usize, max_queue: usize, queue_timeout: Duration) -> Self {
        Self {
            max_concurrent,
            max_queue,
            queue_timeout,
        }
    }
}

impl ResilienceConfig for BulkheadConfig {
    const SECTION: &'static str = "bulkhead";

    fn validate(&self) -> ResilienceResult<()> {
        resilience_ensure!(
            self.max_concurrent > 0,
            config field::<Self>("max_concurrent"),
            "must be > 0, got {}",
            self.max_concurrent
        );
        resilience_ensure!(
            self.max_queue == 0 || !self.queue_timeout.is_zero(),
            config field::<Self>("queue_timeout"),
            "must be > 0 when max_queue is {}",
            self.max_queue
        );
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Point-in-time view of a bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    /// Slots currently held
    pub active: usize,
    /// Callers waiting
    pub queued: usize,
    /// Callers rejected because the queue was full
    pub rejected: u64,
    /// Callers that gave up after the queue timeout
    pub timed_out: u64,
    /// Configured concurrency
    pub max_concurrent: usize,
    /// Configured queue length
    pub max_queue: usize,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
    rejected: u64,
    timed_out: u64,
}

struct Shared {
    policy: String,
    config: BulkheadConfig,
    state: Mutex<State>,
    observability: Observability,
}

impl Shared {
    /// Give a slot back: hand it to the head waiter, or free it.
    fn release(&self) {
        let queued = {
            let mut state = self.state.lock();
            loop {
                match state.waiters.pop_front() {
                    Some(waiter) => {
                        if waiter.grant.send(()).is_ok() {
                            break Some(state.waiters.len());
                        }
                    }
                    None => {
                        state.active = state.active.saturating_sub(1);
                        break None;
                    }
                }
            }
        };
        if let Some(queued) = queued {
            self.observability
                .metrics()
                .record_bulkhead_queue(&self.policy, queued);
        }
    }
}

/// Held slot; dropping it releases the slot
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    shared: Arc<Shared>,
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("policy", &self.shared.policy)
            .finish()
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Removes a waiter from the queue if it gives up, including when its
/// future is dropped. If the slot was granted in the meantime it is passed on.
struct WaitGuard {
    shared: Arc<Shared>,
    id: u64,
    grant: oneshot::Receiver<()>,
    admitted: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let (was_queued, queued) = {
            let mut state = self.shared.state.lock();
            let position = state.waiters.iter().position(|w| w.id == self.id);
            if let Some(position) = position {
                state.waiters.remove(position);
            }
            (position.is_some(), state.waiters.len())
        };
        if was_queued {
            self.shared
                .observability
                .metrics()
                .record_bulkhead_queue(&self.shared.policy, queued);
        } else {
            // Granted while we were giving up.
            self.shared.release();
        }
    }
}

/// Bulkhead owned by one policy
#[derive(Clone)]
pub struct Bulkhead {
    shared: Arc<Shared>,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("policy", &self.shared.policy)
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Bulkhead {
    /// Create a bulkhead, validating the config
    pub fn new(
        policy: impl Into<String>,
        config: BulkheadConfig,
        observability: Observability,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                policy: policy.into(),
                config,
                state: Mutex::new(State::default()),
                observability,
            }),
        })
    }

    /// Bound configuration
    pub fn config(&self) -> &BulkheadConfig {
        &self.shared.config
    }

    /// Snapshot of counters
    pub fn stats(&self) -> BulkheadStats {
        let state = self.shared.state.lock();
        BulkheadStats {
            active: state.active,
            queued: state.waiters.len(),
            rejected: state.rejected,
            timed_out: state.timed_out,
            max_concurrent: self.shared.config.max_concurrent,
            max_queue: self.shared.config.max_queue,
        }
    }

    fn permit(&self) -> BulkheadPermit {
        BulkheadPermit {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take a free slot without queueing
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        let mut state = self.shared.state.lock();
        if state.active < self.shared.config.max_concurrent && state.waiters.is_empty() {
            state.active += 1;
            drop(state);
            Some(self.permit())
        } else {
            None
        }
    }

    /// Acquire a slot, waiting in the FIFO queue if necessary.
    ///
    /// Fails with [`ResilienceError::BulkheadFull`] when the queue is full,
    /// [`ResilienceError::BulkheadTimeout`] after `queue_timeout`, or the
    /// context's cancellation error.
    pub async fn acquire(&self, ctx: &CancellationContext) -> ResilienceResult<BulkheadPermit> {
        if ctx.is_cancelled() {
            return Err(ctx.error());
        }

        let shared = &self.shared;
        let (id, grant, queued) = {
            let mut state = shared.state.lock();
            if state.active < shared.config.max_concurrent && state.waiters.is_empty() {
                state.active += 1;
                drop(state);
                return Ok(self.permit());
            }

            if state.waiters.len() >= shared.config.max_queue {
                state.rejected += 1;
                let (active, queued) = (state.active, state.waiters.len());
                drop(state);
                return Err(self.reject(active, queued));
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant: tx });
            (id, rx, state.waiters.len())
        };

        shared
            .observability
            .metrics()
            .record_bulkhead_queue(&shared.policy, queued);
        debug!(policy = %shared.policy, queued, "Waiting for bulkhead slot");

        let mut guard = WaitGuard {
            shared: Arc::clone(shared),
            id,
            grant,
            admitted: false,
        };
        let started = Instant::now();
        let timeout = shared.config.queue_timeout;

        tokio::select! {
            granted = &mut guard.grant => {
                // Whoever dequeued us either granted a slot or went away; in
                // neither case is there anything left to clean up.
                guard.admitted = true;
                match granted {
                    Ok(()) => Ok(self.permit()),
                    Err(_) => Err(ResilienceError::cancelled(Some("bulkhead closed".to_string()))),
                }
            }
            () = tokio::time::sleep(timeout) => {
                drop(guard);
                let waited = started.elapsed();
                shared.state.lock().timed_out += 1;
                debug!(policy = %shared.policy, waited_ms = waited.as_millis() as u64, "Bulkhead queue wait timed out");
                shared.observability.emit(&ResilienceEvent::BulkheadTimeout {
                    policy: shared.policy.clone(),
                    waited,
                });
                Err(ResilienceError::BulkheadTimeout {
                    policy: shared.policy.clone(),
                    waited,
                })
            }
            () = ctx.cancelled() => {
                drop(guard);
                Err(ctx.error())
            }
        }
    }

    fn reject(&self, active: usize, queued: usize) -> ResilienceError {
        let shared = &self.shared;
        debug!(policy = %shared.policy, active, queued, "Bulkhead full, rejecting");
        shared.observability.emit(&ResilienceEvent::BulkheadRejected {
            policy: shared.policy.clone(),
            active,
            queued,
        });
        ResilienceError::BulkheadFull {
            policy: shared.policy.clone(),
            max_concurrent: shared.config.max_concurrent,
            max_queue: shared.config.max_queue,
        }
    }
}
