//! Observability: lifecycle events and execution metrics
//!
//! The engine reports through two collaborator traits:
//!
//! - [`EventEmitter`] receives [`ResilienceEvent`]s (breaker transitions,
//!   retries, rejections, reloads);
//! - [`MetricsRecorder`] receives one [`ExecutionMetrics`] per call plus
//!   per-pattern counters.
//!
//! [`Observability`] bundles one of each and is shared by every primitive a
//! registry builds.

mod hooks;
mod metrics;

use std::fmt;
use std::sync::Arc;

pub use hooks::{
    CompositeEmitter, EventEmitter, LogLevel, LoggingEmitter, NoopEmitter, ResilienceEvent,
};
pub use metrics::{
    DurationStats, ExecutionMetrics, InMemoryMetrics, MetricsRecorder, NoopMetrics, Outcome,
    PolicyMetricsSnapshot,
};

/// Shared handle to the event and metrics sinks
#[derive(Clone)]
pub struct Observability {
    events: Arc<dyn EventEmitter>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Observability {
    /// Bundle an emitter and a recorder
    pub fn new(events: Arc<dyn EventEmitter>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { events, metrics }
    }

    /// Sinks that drop everything
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopEmitter), Arc::new(NoopMetrics))
    }

    /// Replace the event emitter
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventEmitter>) -> Self {
        self.events = events;
        self
    }

    /// Replace the metrics recorder
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Emit an event
    pub fn emit(&self, event: &ResilienceEvent) {
        self.events.emit(event);
    }

    /// The metrics recorder
    pub fn metrics(&self) -> &dyn MetricsRecorder {
        self.metrics.as_ref()
    }
}

impl Default for Observability {
    /// Events go to `tracing`, metrics are dropped
    fn default() -> Self {
        Self::new(Arc::new(LoggingEmitter::new()), Arc::new(NoopMetrics))
    }
}

impl fmt::Debug for Observability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observability").finish_non_exhaustive()
    }
}
