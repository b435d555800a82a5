//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the engine, the policy cache, the cluster store, the violation builder and
//! the event recorder.

use std::sync::Arc;

use crate::cache::PolicyCache;
use crate::client::ClusterStore;
use crate::engine::PolicyEngine;
use crate::events::{EventRecorder, PolicyEvent};
use crate::health::HealthState;
use crate::violation::ViolationBuilder;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    pub engine: PolicyEngine,
    /// Read-only policy cache
    pub cache: PolicyCache,
    /// Generic cluster object access
    pub store: Arc<dyn ClusterStore>,
    pub violations: ViolationBuilder,
    /// Optional event recorder
    recorder: Option<EventRecorder>,
    /// Optional health state for metrics
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        cache: PolicyCache,
        store: Arc<dyn ClusterStore>,
        violations: ViolationBuilder,
        recorder: Option<EventRecorder>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            engine: PolicyEngine::new(),
            cache,
            store,
            violations,
            recorder,
            health_state,
        }
    }

    /// Queue an event; a no-op without a recorder
    pub fn emit(&self, event: PolicyEvent) {
        if let Some(recorder) = &self.recorder {
            recorder.emit(event);
        }
    }
}
