//! Admission decisions.
//!
//! `evaluate` turns a resource and a policy snapshot into an
//! `AdmissionDecision`: validation first, a denial on a blocking verdict,
//! otherwise mutation with the resulting patch. The decision also carries
//! the events to emit and the policies whose background reconciliation
//! should be nudged. It does no I/O, so the server can run it on the
//! blocking pool; with a deadline it stops between policies once time is up.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde_json::Value;
use tracing::warn;

use crate::cache::PolicySnapshot;
use crate::crd::{FailureAction, ResourceRef};
use crate::engine::{
    EngineError, GenerationResponse, MutationResponse, PatchOperation, PolicyEngine, RuleError,
    ValidationResponse, Verdict,
};
use crate::events::{Component, PolicyEvent};

/// Message returned when evaluation broke down under an enforcing policy.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while evaluating policies";

const DEADLINE_EXCEEDED: &str = "evaluation deadline exceeded";

/// Coarse result, used for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Mutated,
    Denied,
    Faulted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Mutated => "mutated",
            Outcome::Denied => "denied",
            Outcome::Faulted => "faulted",
        }
    }
}

/// Everything the server needs to answer one admission request.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Denial message.
    pub message: Option<String>,
    /// Short reason code prefixed to the denial message.
    pub reason: Option<String>,
    /// Patch to return with an allow (may be empty).
    pub patches: Vec<PatchOperation>,
    pub events: Vec<PolicyEvent>,
    /// Policies to reconcile soon.
    pub nudges: BTreeSet<String>,
    pub outcome: Outcome,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
            reason: None,
            patches: Vec::new(),
            events: Vec::new(),
            nudges: BTreeSet::new(),
            outcome: Outcome::Allowed,
        }
    }

    pub fn deny(reason: &str, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
            reason: Some(reason.to_string()),
            outcome: Outcome::Denied,
            ..Self::allow()
        }
    }

    /// Decision when evaluation could not complete: deny if any policy
    /// enforces, otherwise admit and leave a warning event.
    pub fn fault(resource: &ResourceRef, detail: &str, snapshot: &PolicySnapshot) -> Self {
        warn!(resource = %resource, error = %detail, "Policy evaluation fault");
        let mut decision = if snapshot.any_enforcing() {
            Self::deny("InternalError", INTERNAL_ERROR_MESSAGE)
        } else {
            let mut allowed = Self::allow();
            allowed
                .events
                .push(PolicyEvent::engine_fault(resource, detail));
            allowed
        };
        decision.outcome = Outcome::Faulted;
        decision
    }
}

/// Evaluate a CREATE or UPDATE request.
pub fn evaluate(
    engine: &PolicyEngine,
    resource: &Value,
    snapshot: &PolicySnapshot,
) -> AdmissionDecision {
    evaluate_until(engine, resource, snapshot, None)
}

/// Evaluate a CREATE or UPDATE request, giving up with a fault once
/// `deadline` has passed. The deadline is checked before each policy.
pub fn evaluate_until(
    engine: &PolicyEngine,
    resource: &Value,
    snapshot: &PolicySnapshot,
    deadline: Option<Instant>,
) -> AdmissionDecision {
    let identity = ResourceRef::from_object(resource);
    let expired = || AdmissionDecision::fault(&identity, DEADLINE_EXCEEDED, snapshot);
    let mut events = Vec::new();
    let mut nudges = BTreeSet::new();

    let Some(validation) = validate_until(engine, resource, snapshot, deadline) else {
        return expired();
    };
    if let Some(detail) = collect_errors(&validation.errors, &mut events) {
        return AdmissionDecision::fault(&identity, &detail, snapshot);
    }
    for failure in &validation.failures {
        if failure.action == FailureAction::Audit {
            events.push(PolicyEvent::audit_failure(&identity, &failure.message));
            nudges.insert(failure.policy.clone());
        }
    }
    if let Verdict::Deny { message } = &validation.verdict {
        let mut decision = AdmissionDecision::deny("RequestBlocked", message.clone());
        events.push(PolicyEvent::request_blocked(&identity, message));
        decision.events = events;
        decision.nudges = nudges;
        return decision;
    }

    let Some(mutation) = mutate_until(engine, resource, snapshot, deadline) else {
        return expired();
    };
    if let Some(detail) = collect_errors(&mutation.errors, &mut events) {
        return AdmissionDecision::fault(&identity, &detail, snapshot);
    }
    let mut applied: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for rule in &mutation.applied {
        applied
            .entry(rule.policy.as_str())
            .or_default()
            .push(rule.rule.clone());
    }
    for (policy, rules) in &applied {
        events.push(PolicyEvent::policy_applied(&identity, policy, rules));
    }

    // generated resources are created by the controller
    let mut generation = GenerationResponse::default();
    for policy in snapshot.iter() {
        if past(deadline) {
            return expired();
        }
        let one = engine.generate(&mutation.patched, &PolicySnapshot::single(policy.clone()));
        generation.requests.extend(one.requests);
        generation.errors.extend(one.errors);
    }
    if let Some(detail) = collect_errors(&generation.errors, &mut events) {
        return AdmissionDecision::fault(&identity, &detail, snapshot);
    }
    nudges.extend(generation.requests.iter().map(|r| r.policy.clone()));

    AdmissionDecision {
        allowed: true,
        message: None,
        reason: None,
        outcome: if mutation.patches.is_empty() {
            Outcome::Allowed
        } else {
            Outcome::Mutated
        },
        patches: mutation.patches,
        events,
        nudges,
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Admission validation one policy at a time; stops at the first blocking
/// failure. `None` once the deadline passed.
fn validate_until(
    engine: &PolicyEngine,
    resource: &Value,
    snapshot: &PolicySnapshot,
    deadline: Option<Instant>,
) -> Option<ValidationResponse> {
    let mut response = ValidationResponse {
        verdict: Verdict::Allow,
        failures: Vec::new(),
        passed: Vec::new(),
        errors: Vec::new(),
    };
    for policy in snapshot.iter() {
        if past(deadline) {
            return None;
        }
        let one = engine.validate(resource, &PolicySnapshot::single(policy.clone()));
        response.failures.extend(one.failures);
        response.passed.extend(one.passed);
        response.errors.extend(one.errors);
        if one.verdict != Verdict::Allow {
            response.verdict = one.verdict;
            break;
        }
    }
    Some(response)
}

/// Mutation one policy at a time, each seeing the previous policies' result.
/// `None` once the deadline passed.
fn mutate_until(
    engine: &PolicyEngine,
    resource: &Value,
    snapshot: &PolicySnapshot,
    deadline: Option<Instant>,
) -> Option<MutationResponse> {
    let mut response = MutationResponse {
        patched: resource.clone(),
        patches: Vec::new(),
        applied: Vec::new(),
        errors: Vec::new(),
    };
    for policy in snapshot.iter() {
        if past(deadline) {
            return None;
        }
        let one = engine.mutate(&response.patched, &PolicySnapshot::single(policy.clone()));
        response.patched = one.patched;
        response.patches.extend(one.patches);
        response.applied.extend(one.applied);
        response.errors.extend(one.errors);
    }
    Some(response)
}

/// Queue events for malformed rules; return the detail of the first fault.
fn collect_errors(errors: &[RuleError], events: &mut Vec<PolicyEvent>) -> Option<String> {
    for rule_error in errors {
        match &rule_error.error {
            EngineError::Fault(_) => return Some(rule_error.to_string()),
            EngineError::MalformedPolicy(detail) => events.push(PolicyEvent::processing_failed(
                &rule_error.policy,
                &rule_error.rule,
                detail,
                Component::Webhook,
            )),
        }
    }
    None
}
