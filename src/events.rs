//! Event Recorder.
//!
//! `EventRecorder::emit` only enqueues; a single background `EventWorker`
//! writes queued events through an `EventSink` with bounded retry. Events
//! that exhaust their retries are dropped with a warning. On shutdown the
//! worker drains what it can within a deadline and logs what it discards.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::client::Result;
use crate::crd::{API_GROUP, ResourceRef, ViolationKey};
use crate::health::HealthState;

/// Queue depth at which a warning is logged.
const DEPTH_WARNING_THRESHOLD: usize = 1024;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// Reason codes for emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    RequestBlocked,
    PolicyViolation,
    PolicyApplied,
    ProcessingFailed,
    EngineFault,
    ResourceGenerated,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::RequestBlocked => "RequestBlocked",
            EventReason::PolicyViolation => "PolicyViolation",
            EventReason::PolicyApplied => "PolicyApplied",
            EventReason::ProcessingFailed => "ProcessingFailed",
            EventReason::EngineFault => "EngineFault",
            EventReason::ResourceGenerated => "ResourceGenerated",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            EventReason::RequestBlocked => "Deny",
            EventReason::PolicyViolation => "Validate",
            EventReason::PolicyApplied => "Mutate",
            EventReason::ProcessingFailed | EventReason::EngineFault => "Evaluate",
            EventReason::ResourceGenerated => "Generate",
        }
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Webhook,
    Controller,
}

impl Component {
    /// Reporting controller name written on the event.
    pub fn reporting_controller(&self) -> &'static str {
        match self {
            Component::Webhook => "kube-policy-webhook",
            Component::Controller => "kube-policy-controller",
        }
    }
}

/// A queued event.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvent {
    pub object: ObjectReference,
    pub reason: EventReason,
    pub severity: Severity,
    pub message: String,
    pub source: Component,
}

impl PolicyEvent {
    pub fn new(
        object: ObjectReference,
        reason: EventReason,
        severity: Severity,
        message: impl Into<String>,
        source: Component,
    ) -> Self {
        Self {
            object,
            reason,
            severity,
            message: message.into(),
            source,
        }
    }

    /// Admission denied.
    pub fn request_blocked(resource: &ResourceRef, message: &str) -> Self {
        Self::new(
            resource_object(resource),
            EventReason::RequestBlocked,
            Severity::Warning,
            message,
            Component::Webhook,
        )
    }

    /// Admitted despite a failing rule of an auditing policy.
    pub fn audit_failure(resource: &ResourceRef, message: &str) -> Self {
        Self::new(
            resource_object(resource),
            EventReason::PolicyViolation,
            Severity::Warning,
            message,
            Component::Webhook,
        )
    }

    /// Mutation rules of `policy` changed the resource.
    pub fn policy_applied(resource: &ResourceRef, policy: &str, rules: &[String]) -> Self {
        Self::new(
            resource_object(resource),
            EventReason::PolicyApplied,
            Severity::Normal,
            format!("Policy '{}' applied rules: {}", policy, rules.join(", ")),
            Component::Webhook,
        )
    }

    /// A rule of `policy` could not be evaluated.
    pub fn processing_failed(policy: &str, rule: &str, error: &str, source: Component) -> Self {
        Self::new(
            policy_object(policy),
            EventReason::ProcessingFailed,
            Severity::Warning,
            format!("Rule '{}' could not be processed: {}", rule, error),
            source,
        )
    }

    /// Evaluation broke down for a request that was nevertheless admitted.
    pub fn engine_fault(resource: &ResourceRef, detail: &str) -> Self {
        Self::new(
            resource_object(resource),
            EventReason::EngineFault,
            Severity::Warning,
            format!("Policy evaluation failed, request admitted: {}", detail),
            Component::Webhook,
        )
    }

    /// A new violation record was created.
    pub fn violation_recorded(key: &ViolationKey, message: &str) -> Self {
        Self::new(
            policy_object(&key.policy),
            EventReason::PolicyViolation,
            Severity::Warning,
            format!("Rule '{}' failed on {}: {}", key.rule, key.resource, message),
            Component::Controller,
        )
    }

    /// A resource was generated for a trigger.
    pub fn resource_generated(policy: &str, rule: &str, target: &ResourceRef) -> Self {
        Self::new(
            policy_object(policy),
            EventReason::ResourceGenerated,
            Severity::Normal,
            format!("Rule '{}' generated {}", rule, target),
            Component::Controller,
        )
    }
}

/// Object reference for a cluster resource.
pub fn resource_object(resource: &ResourceRef) -> ObjectReference {
    ObjectReference {
        kind: Some(resource.kind.clone()),
        namespace: resource.namespace.clone(),
        name: Some(resource.name.clone()),
        ..Default::default()
    }
}

/// Object reference for a Policy.
pub fn policy_object(policy: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/v1alpha1", API_GROUP)),
        kind: Some("Policy".to_string()),
        name: Some(policy.to_string()),
        ..Default::default()
    }
}

/// Destination for events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn write(&self, event: &PolicyEvent) -> Result<()>;
}

/// `EventSink` publishing through the kube events API.
pub struct KubeEventSink {
    client: Client,
    instance: Option<String>,
}

impl KubeEventSink {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, instance }
    }

    fn recorder(&self, source: Component) -> Recorder {
        Recorder::new(
            self.client.clone(),
            Reporter {
                controller: source.reporting_controller().into(),
                instance: self.instance.clone(),
            },
        )
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn write(&self, event: &PolicyEvent) -> Result<()> {
        let type_ = match event.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        self.recorder(event.source)
            .publish(
                &Event {
                    type_,
                    reason: event.reason.as_str().into(),
                    note: Some(event.message.clone()),
                    action: event.reason.action().into(),
                    secondary: None,
                },
                &event.object,
            )
            .await?;
        Ok(())
    }
}

/// Retry budget for one event.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Handle for emitting events. Cheap to clone.
#[derive(Clone)]
pub struct EventRecorder {
    tx: mpsc::UnboundedSender<PolicyEvent>,
    depth: Arc<AtomicUsize>,
    health: Option<Arc<HealthState>>,
}

impl EventRecorder {
    /// Create a recorder and the worker that drains it.
    pub fn new(
        sink: Arc<dyn EventSink>,
        retry: RetryPolicy,
        drain_timeout: Duration,
        health: Option<Arc<HealthState>>,
    ) -> (Self, EventWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let recorder = Self {
            tx,
            depth: depth.clone(),
            health: health.clone(),
        };
        let worker = EventWorker {
            rx,
            sink,
            retry,
            drain_timeout,
            depth,
            health,
        };
        (recorder, worker)
    }

    /// Queue an event. Never blocks.
    pub fn emit(&self, event: PolicyEvent) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            debug!("Event worker stopped, event discarded");
            return;
        }
        if depth == DEPTH_WARNING_THRESHOLD {
            warn!(depth, "Event queue is backing up");
        }
        if let Some(health) = &self.health {
            health.metrics.set_event_queue_depth(depth);
        }
    }

    /// Events queued and not yet taken by the worker.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Counters reported when the worker stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub delivered: usize,
    pub dropped: usize,
    pub discarded: usize,
}

/// Single consumer of the event queue.
pub struct EventWorker {
    rx: mpsc::UnboundedReceiver<PolicyEvent>,
    sink: Arc<dyn EventSink>,
    retry: RetryPolicy,
    drain_timeout: Duration,
    depth: Arc<AtomicUsize>,
    health: Option<Arc<HealthState>>,
}

impl EventWorker {
    /// Deliver events until `shutdown` turns true, then drain.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!("Event worker started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // a dropped sender also means stop
                    if changed.is_err() {
                        break;
                    }
                }
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event, &mut stats).await,
                    None => return stats,
                },
            }
        }

        self.rx.close();
        let drain_timeout = self.drain_timeout;
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(event) = self.rx.recv().await {
                self.handle(event, &mut stats).await;
            }
        })
        .await;
        if drained.is_err() {
            stats.discarded = self.depth.swap(0, Ordering::SeqCst);
            warn!(discarded = stats.discarded, "Event queue not drained before shutdown deadline");
        }
        info!(
            delivered = stats.delivered,
            dropped = stats.dropped,
            discarded = stats.discarded,
            "Event worker stopped"
        );
        stats
    }

    async fn handle(&self, event: PolicyEvent, stats: &mut WorkerStats) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if let Some(health) = &self.health {
            health.metrics.set_event_queue_depth(depth);
        }
        if self.deliver(&event).await {
            stats.delivered += 1;
        } else {
            stats.dropped += 1;
            if let Some(health) = &self.health {
                health.metrics.record_event_dropped();
            }
        }
    }

    async fn deliver(&self, event: &PolicyEvent) -> bool {
        for attempt in 1..=self.retry.attempts {
            match self.sink.write(event).await {
                Ok(()) => return true,
                Err(e) if attempt < self.retry.attempts => {
                    debug!(reason = %event.reason, attempt, error = %e, "Event write failed, retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                Err(e) => {
                    warn!(
                        reason = %event.reason,
                        object = ?event.object.name,
                        attempts = attempt,
                        error = %e,
                        "Dropping event after exhausting retries"
                    );
                }
            }
        }
        false
    }
}
