//! Policy change feed
//!
//! Persistence lives outside the engine; it only needs a stream of
//! [`PolicyEvent`]s. [`InMemoryPolicyRepository`] is the in-process source
//! used by tests and by hosts that push configuration programmatically.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{CancellationContext, ResilienceResult};
use crate::policy::Policy;

/// Default buffer of each watch channel
const DEFAULT_WATCH_CAPACITY: usize = 64;

/// Kind of policy change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEventKind {
    /// First version of a policy
    Created,
    /// New version of an existing policy
    Updated,
    /// Policy removed
    Deleted,
}

/// A change reported by a [`PolicyRepository`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvent {
    /// Kind of change
    pub kind: PolicyEventKind,
    /// Policy name
    pub name: String,
    /// Version after the change (last version for deletions)
    pub version: u64,
    /// New definition; `None` for deletions
    pub policy: Option<Policy>,
    /// When the change happened
    pub timestamp: SystemTime,
}

impl PolicyEvent {
    /// Created or updated event carrying `policy`
    pub fn upserted(kind: PolicyEventKind, policy: Policy) -> Self {
        Self {
            kind,
            name: policy.name.clone(),
            version: policy.version,
            policy: Some(policy),
            timestamp: SystemTime::now(),
        }
    }

    /// Deletion event
    pub fn deleted(name: impl Into<String>, version: u64) -> Self {
        Self {
            kind: PolicyEventKind::Deleted,
            name: name.into(),
            version,
            policy: None,
            timestamp: SystemTime::now(),
        }
    }
}

/// Source of policy change notifications
pub trait PolicyRepository: Send + Sync {
    /// Subscribe to changes. The stream ends once `ctx` is cancelled or the
    /// repository goes away.
    fn watch(&self, ctx: &CancellationContext) -> mpsc::Receiver<PolicyEvent>;
}

struct Subscriber {
    id: u64,
    ctx: CancellationContext,
    tx: mpsc::Sender<PolicyEvent>,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// In-process policy store with watch support.
///
/// Versions are assigned by the store: a new policy starts at
/// `max(1, policy.version)`, each update bumps the stored version by one.
///
/// Lock order is `subscribers` then `policies`. Mutations publish while
/// still holding `subscribers`, so a new watcher sees every change either
/// in its snapshot or on its channel, in version order.
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<String, Policy>>,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    shutdown: CancellationToken,
    capacity: usize,
}

impl fmt::Debug for InMemoryPolicyRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watchers = self.watcher_count();
        let policies = self.policies.read().len();
        f.debug_struct("InMemoryPolicyRepository")
            .field("policies", &policies)
            .field("watchers", &watchers)
            .finish()
    }
}

impl Default for InMemoryPolicyRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPolicyRepository {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Create an empty store whose watch channels buffer `capacity` events
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert or replace a policy; returns the stored version.
    pub fn upsert(&self, mut policy: Policy) -> ResilienceResult<Policy> {
        policy.validate()?;
        let mut subscribers = self.subscribers.lock();
        let kind = {
            let mut policies = self.policies.write();
            let kind = match policies.get(&policy.name) {
                Some(existing) => {
                    policy.version = existing.version + 1;
                    PolicyEventKind::Updated
                }
                None => {
                    policy.version = policy.version.max(1);
                    PolicyEventKind::Created
                }
            };
            policies.insert(policy.name.clone(), policy.clone());
            kind
        };
        Self::publish(&mut subscribers, &PolicyEvent::upserted(kind, policy.clone()));
        Ok(policy)
    }

    /// Remove a policy
    pub fn delete(&self, name: &str) -> Option<Policy> {
        let mut subscribers = self.subscribers.lock();
        let removed = self.policies.write().remove(name)?;
        Self::publish(&mut subscribers, &PolicyEvent::deleted(name, removed.version));
        Some(removed)
    }

    /// Stored policy by name
    pub fn get(&self, name: &str) -> Option<Policy> {
        self.policies.read().get(name).cloned()
    }

    /// All stored policies, sorted by name
    pub fn list(&self) -> Vec<Policy> {
        let mut policies: Vec<_> = self.policies.read().values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    /// Number of live watchers
    pub fn watcher_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn publish(subscribers: &mut Vec<Subscriber>, event: &PolicyEvent) {
        subscribers.retain(|sub| !sub.ctx.is_cancelled() && !sub.tx.is_closed());
        for sub in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                warn!(
                    policy = %event.name,
                    kind = ?event.kind,
                    "Policy watcher is lagging, event dropped"
                );
            }
        }
    }
}

impl Drop for InMemoryPolicyRepository {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drop the watcher's sender as soon as its context is cancelled, so the
/// stream ends without waiting for the next change.
fn unsubscribe_on_cancel(
    subscribers: Weak<Mutex<Vec<Subscriber>>>,
    shutdown: CancellationToken,
    ctx: CancellationContext,
    id: u64,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        // No runtime: the sender is pruned on the next publish instead.
        return;
    };
    handle.spawn(async move {
        tokio::select! {
            () = ctx.cancelled() => {
                if let Some(subscribers) = subscribers.upgrade() {
                    subscribers.lock().retain(|sub| sub.id != id);
                    debug!(watcher = id, "Policy watcher cancelled");
                }
            }
            () = shutdown.cancelled() => {}
        }
    });
}

impl PolicyRepository for InMemoryPolicyRepository {
    /// Replays the current policies as `Created` events, then streams changes.
    fn watch(&self, ctx: &CancellationContext) -> mpsc::Receiver<PolicyEvent> {
        let mut subscribers = self.subscribers.lock();
        let snapshot = self.list();
        let (tx, rx) = mpsc::channel(self.capacity.max(snapshot.len()));
        for policy in snapshot {
            // Capacity covers the whole snapshot.
            let _ = tx.try_send(PolicyEvent::upserted(PolicyEventKind::Created, policy));
        }
        if !ctx.is_cancelled() {
            let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
            subscribers.push(Subscriber {
                id,
                ctx: ctx.clone(),
                tx,
            });
            unsubscribe_on_cancel(
                Arc::downgrade(&self.subscribers),
                self.shutdown.clone(),
                ctx.clone(),
                id,
            );
        }
        rx
    }
}
