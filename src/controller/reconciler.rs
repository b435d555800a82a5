//! Reconciliation of one Policy against existing cluster state.
//!
//! A pass lists every resource of the kinds the policy's rules name, audits
//! each one, records failures as violations, creates missing generated
//! resources, and finally clears violations of this policy that the pass no
//! longer observed. A policy missing from the synced cache has been deleted;
//! its violations are removed and generated resources are left in place.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::PolicySnapshot;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::queue::WorkQueue;
use crate::crd::{Policy, ResourceRef, ViolationKey};
use crate::engine::{EngineError, GenerationRequest, GenerationSource, RuleError, guarded};
use crate::events::{Component, PolicyEvent};

/// What a pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Resources audited.
    pub resources: usize,
    /// Violations created or refreshed.
    pub recorded: usize,
    /// Violations removed.
    pub cleared: usize,
    /// Resources generated.
    pub generated: usize,
}

/// Reconcile the policy named `name`.
pub async fn reconcile(name: &str, ctx: &Context) -> Result<ReconcileReport> {
    if !ctx.cache.is_ready() {
        return Err(Error::CacheNotSynced);
    }
    let Some(policy) = ctx.cache.get(name) else {
        let cleared = ctx.violations.clear_policy(name).await?;
        debug!(policy = %name, cleared, "Policy no longer exists");
        return Ok(ReconcileReport {
            cleared,
            ..Default::default()
        });
    };

    let snapshot = PolicySnapshot::single(policy.clone());
    let previous = ctx.violations.keys_for_policy(name).await?;
    let mut report = ReconcileReport::default();
    let mut failing = BTreeSet::new();
    let mut reported = BTreeSet::new();

    for kind in target_kinds(&policy) {
        let resources = ctx.store.list(kind, None).await?;
        debug!(policy = %name, kind = %kind, count = resources.len(), "Auditing existing resources");
        for resource in resources {
            report.resources += 1;
            let identity = ResourceRef::from_object(&resource);

            let audit = guarded(|| ctx.engine.audit(&resource, &snapshot))?;
            check_errors(ctx, &audit.errors, &mut reported)?;
            for failure in &audit.failures {
                let key = ViolationKey::new(name, identity.clone(), &failure.rule);
                ctx.violations.record(&key, &failure.message).await?;
                report.recorded += 1;
                failing.insert(key);
            }

            let generation = guarded(|| ctx.engine.generate(&resource, &snapshot))?;
            check_errors(ctx, &generation.errors, &mut reported)?;
            for request in &generation.requests {
                if ensure_generated(ctx, request).await? {
                    report.generated += 1;
                }
            }
        }
    }

    // only reached when every listing succeeded, so absence is meaningful
    for key in previous.difference(&failing) {
        ctx.violations.clear(key).await?;
        report.cleared += 1;
    }

    Ok(report)
}

/// Kinds named by rules that validate or generate, deduplicated.
fn target_kinds(policy: &Policy) -> BTreeSet<&str> {
    policy
        .spec
        .rules
        .iter()
        .filter(|rule| rule.validate.is_some() || rule.generate.is_some())
        .flat_map(|rule| rule.resource.kinds.iter().map(String::as_str))
        .collect()
}

/// Fail the pass on a fault; report each malformed rule once per pass.
fn check_errors(
    ctx: &Context,
    errors: &[RuleError],
    reported: &mut BTreeSet<String>,
) -> Result<()> {
    for rule_error in errors {
        match &rule_error.error {
            EngineError::Fault(_) => return Err(Error::Engine(rule_error.error.clone())),
            EngineError::MalformedPolicy(detail) => {
                if reported.insert(rule_error.rule.clone()) {
                    warn!(policy = %rule_error.policy, rule = %rule_error.rule, error = %detail, "Skipping malformed rule");
                    ctx.emit(PolicyEvent::processing_failed(
                        &rule_error.policy,
                        &rule_error.rule,
                        detail,
                        Component::Controller,
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Create the requested resource unless it already exists. Returns whether
/// an object was created.
async fn ensure_generated(ctx: &Context, request: &GenerationRequest) -> Result<bool> {
    let namespace = request.namespace.as_deref();
    let target = request.target();
    if ctx
        .store
        .get(&request.kind, namespace, &request.name)
        .await?
        .is_some()
    {
        return Ok(false);
    }

    let cloned: Option<Value> = match &request.source {
        GenerationSource::Clone(from) => {
            match ctx
                .store
                .get(&request.kind, Some(&from.namespace), &from.name)
                .await?
            {
                Some(source) => Some(source),
                None => {
                    warn!(
                        policy = %request.policy,
                        rule = %request.rule,
                        source = %format!("{}/{}", from.namespace, from.name),
                        "Clone source not found, skipping generation"
                    );
                    return Ok(false);
                }
            }
        }
        GenerationSource::Data(_) => None,
    };

    let object = match request.render(cloned.as_ref()) {
        Ok(object) => object,
        Err(EngineError::MalformedPolicy(detail)) => {
            ctx.emit(PolicyEvent::processing_failed(
                &request.policy,
                &request.rule,
                &detail,
                Component::Controller,
            ));
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    match ctx.store.create(&request.kind, namespace, object).await {
        Ok(_) => {
            info!(policy = %request.policy, rule = %request.rule, target = %target, trigger = %request.trigger, "Generated resource");
            ctx.emit(PolicyEvent::resource_generated(&request.policy, &request.rule, &target));
            Ok(true)
        }
        // created concurrently; the goal is met
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Run one pass for `key` under `timeout` and settle the key in the queue.
pub async fn process(queue: &WorkQueue, ctx: &Context, key: &str, timeout: Duration) {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, reconcile(key, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    };

    match result {
        Ok(report) => {
            queue.forget(key);
            if let Some(health) = &ctx.health_state {
                health
                    .metrics
                    .record_reconcile(key, start.elapsed().as_secs_f64());
            }
            info!(
                policy = %key,
                resources = report.resources,
                recorded = report.recorded,
                cleared = report.cleared,
                generated = report.generated,
                duration_ms = start.elapsed().as_millis() as u64,
                "Reconciled policy"
            );
        }
        Err(e) => {
            if let Some(health) = &ctx.health_state {
                health.metrics.record_error(key);
            }
            error_policy(queue, key, &e);
        }
    }
    queue.done(key);
}

/// Decide how a failed pass is retried.
pub fn error_policy(queue: &WorkQueue, key: &str, error: &Error) {
    if !error.counts_as_attempt() {
        let delay = queue.requeue(key);
        warn!(policy = %key, error = %error, delay_ms = delay.as_millis() as u64, "Pass deferred, requeued");
        return;
    }
    if error.is_retryable() {
        match queue.retry(key) {
            Some(delay) => {
                warn!(policy = %key, error = %error, delay_ms = delay.as_millis() as u64, "Retryable error, will retry")
            }
            None => error!(policy = %key, error = %error, "Reconciliation failed, retries exhausted"),
        }
    } else {
        queue.forget(key);
        error!(policy = %key, error = %error, "Non-retryable error");
    }
}
