//! Policy registry: named policies with atomic hot reload
//!
//! The registry maps a policy name to its current [`PolicyRuntime`]. Entries
//! are created lazily from a default template on first use, replaced whole
//! on reload, and never mutated in place, so a reader sees either the old
//! or the new version.

mod repository;
mod runtime;

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{CancellationContext, ResilienceError, ResilienceResult};
use crate::observability::{Observability, ResilienceEvent};
use crate::policy::Policy;

pub use repository::{InMemoryPolicyRepository, PolicyEvent, PolicyEventKind, PolicyRepository};
pub use runtime::{PolicyRuntime, ReloadStrategy};

/// Placeholder name used to validate the default template
const TEMPLATE_NAME: &str = "default";

/// Registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// What reloads do with existing runtime state
    pub reload_strategy: ReloadStrategy,
    /// Template for names that have no policy; its name is ignored
    pub default_policy: Policy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reload_strategy: ReloadStrategy::Reset,
            default_policy: Policy::new(TEMPLATE_NAME),
        }
    }
}

/// Result of a successful reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The name had no entry
    Created,
    /// The entry was replaced
    Updated,
    /// The offered policy equals the active one; nothing changed
    Unchanged,
}

/// Policy registry
#[derive(Debug)]
pub struct PolicyRegistry {
    entries: DashMap<String, Arc<PolicyRuntime>>,
    default_policy: ArcSwap<Policy>,
    reload_strategy: ReloadStrategy,
    observability: Observability,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(Observability::default())
    }
}

impl PolicyRegistry {
    /// Registry with default settings
    pub fn new(observability: Observability) -> Self {
        Self {
            entries: DashMap::new(),
            default_policy: ArcSwap::from_pointee(Policy::new(TEMPLATE_NAME)),
            reload_strategy: ReloadStrategy::default(),
            observability,
        }
    }

    /// Registry with explicit settings; the default template is validated
    pub fn with_config(
        config: RegistryConfig,
        observability: Observability,
    ) -> ResilienceResult<Self> {
        let registry = Self {
            reload_strategy: config.reload_strategy,
            ..Self::new(observability)
        };
        registry.set_default_policy(config.default_policy)?;
        Ok(registry)
    }

    /// Sinks shared by every primitive this registry builds
    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    /// Reload strategy in effect
    pub fn reload_strategy(&self) -> ReloadStrategy {
        self.reload_strategy
    }

    /// Current default template
    pub fn default_policy(&self) -> Arc<Policy> {
        self.default_policy.load_full()
    }

    /// Replace the template used for unknown names.
    ///
    /// Entries already created from the old template keep their runtime.
    pub fn set_default_policy(&self, mut template: Policy) -> ResilienceResult<()> {
        if template.name.trim().is_empty() {
            template.name = TEMPLATE_NAME.to_string();
        }
        template.validate()?;
        self.default_policy.store(Arc::new(template));
        Ok(())
    }

    /// Runtime for `name`, created from the default template if unknown.
    pub fn get(&self, name: &str) -> ResilienceResult<Arc<PolicyRuntime>> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(Arc::clone(entry.value()));
        }

        let entry = self.entries.entry(name.to_string()).or_try_insert_with(|| {
            let policy = self.default_policy.load().as_ref().clone().with_name(name);
            debug!(policy = name, "Creating runtime from default policy");
            PolicyRuntime::build(policy, &self.observability).map(Arc::new)
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Active policy for `name`, if one has been loaded or created
    pub fn policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.entries
            .get(name)
            .map(|entry| Arc::clone(entry.value().policy()))
    }

    /// Names with an entry, sorted
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate `policy` and swap it in atomically.
    ///
    /// An identical policy is a no-op that keeps the current runtime. A lower
    /// version than the active one is rejected. On any error the previous
    /// policy stays in effect.
    pub fn reload(&self, policy: Policy) -> ResilienceResult<ReloadOutcome> {
        policy.validate()?;
        let name = policy.name.clone();
        let version = policy.version;

        let outcome = match self.entries.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.policy().as_ref() == &policy {
                    return Ok(ReloadOutcome::Unchanged);
                }
                let active = current.policy().version;
                if version < active {
                    return Err(ResilienceError::StaleVersion {
                        name,
                        current: active,
                        offered: version,
                    });
                }
                let next = current.successor(policy, self.reload_strategy, &self.observability)?;
                occupied.insert(Arc::new(next));
                ReloadOutcome::Updated
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(PolicyRuntime::build(policy, &self.observability)?));
                ReloadOutcome::Created
            }
        };

        info!(
            policy = %name,
            version,
            outcome = ?outcome,
            strategy = ?self.reload_strategy,
            "Policy reloaded"
        );
        self.observability.emit(&ResilienceEvent::PolicyReloaded {
            policy: name,
            version,
        });
        Ok(outcome)
    }

    /// Drop the entry for `name`; the next call starts from the default
    /// template again. Returns the removed policy.
    pub fn remove(&self, name: &str) -> Option<Arc<Policy>> {
        let (_, runtime) = self.entries.remove(name)?;
        info!(policy = name, "Policy removed");
        self.observability.emit(&ResilienceEvent::PolicyRemoved {
            policy: name.to_string(),
        });
        Some(Arc::clone(runtime.policy()))
    }

    /// Drop the entry for `name` and report whether one existed
    pub fn evict(&self, name: &str) -> bool {
        self.remove(name).is_some()
    }

    /// Apply one change from a repository feed
    pub fn apply(&self, event: PolicyEvent) -> ResilienceResult<()> {
        match (event.kind, event.policy) {
            (PolicyEventKind::Deleted, _) => {
                self.remove(&event.name);
                Ok(())
            }
            (_, Some(policy)) => self.reload(policy).map(drop),
            (kind, None) => Err(ResilienceError::invalid_config(
                "policy",
                format!("{kind:?} event for '{}' carries no policy", event.name),
            )),
        }
    }

    /// Follow `repository` until its stream ends or `ctx` is cancelled.
    ///
    /// Invalid events are logged and skipped so one bad definition cannot
    /// stall the feed. Returns the number of events applied.
    pub async fn watch<R>(&self, repository: &R, ctx: &CancellationContext) -> usize
    where
        R: PolicyRepository + ?Sized,
    {
        let mut events = repository.watch(ctx);
        let mut applied = 0;
        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let name = event.name.clone();
                    match self.apply(event) {
                        Ok(()) => applied += 1,
                        Err(err) => warn!(policy = %name, error = %err, "Ignoring policy event"),
                    }
                }
            }
        }
        debug!(applied, "Policy watch stopped");
        applied
    }
}
