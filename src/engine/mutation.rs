//! Mutation: apply each matching rule's overlay and patches in declared order.

use serde_json::Value;
use tracing::debug;

use crate::cache::PolicySnapshot;
use crate::crd::MutationSpec;
use crate::engine::error::{EngineError, RuleError};
use crate::engine::matching::rule_matches;
use crate::engine::overlay::overlay_patches;
use crate::engine::patches::{self, PatchOperation};

/// A rule that changed the resource, with the operations it contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRule {
    pub policy: String,
    pub rule: String,
    pub patches: Vec<PatchOperation>,
}

/// Result of a mutation pass.
#[derive(Debug, Clone)]
pub struct MutationResponse {
    /// The resource after all applied rules.
    pub patched: Value,
    /// All operations in application order; applying them to the input
    /// resource yields `patched`.
    pub patches: Vec<PatchOperation>,
    pub applied: Vec<AppliedRule>,
    /// Rules that were skipped because of an error.
    pub errors: Vec<RuleError>,
}

impl MutationResponse {
    pub fn applied_rule_names(&self) -> Vec<String> {
        self.applied.iter().map(|r| r.rule.clone()).collect()
    }

    /// First internal fault raised during the pass, if any.
    pub fn fault(&self) -> Option<&RuleError> {
        self.errors
            .iter()
            .find(|e| matches!(e.error, EngineError::Fault(_)))
    }
}

pub(crate) fn mutate(resource: &Value, snapshot: &PolicySnapshot) -> MutationResponse {
    let mut current = resource.clone();
    let mut all_patches = Vec::new();
    let mut applied = Vec::new();
    let mut errors = Vec::new();

    for policy in snapshot.iter() {
        let policy_name = policy.metadata.name.clone().unwrap_or_default();
        for rule in &policy.spec.rules {
            let Some(spec) = &rule.mutate else {
                continue;
            };
            let rule_error = |error| RuleError {
                policy: policy_name.clone(),
                rule: rule.name.clone(),
                error,
            };
            match rule_matches(&rule.resource, &current) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    errors.push(rule_error(e));
                    continue;
                }
            }
            match apply_rule(&current, spec) {
                Ok((patched, ops)) if !ops.is_empty() => {
                    debug!(policy = %policy_name, rule = %rule.name, operations = ops.len(), "Mutation rule applied");
                    current = patched;
                    all_patches.extend(ops.iter().cloned());
                    applied.push(AppliedRule {
                        policy: policy_name.clone(),
                        rule: rule.name.clone(),
                        patches: ops,
                    });
                }
                Ok(_) => {}
                Err(e) => errors.push(rule_error(e)),
            }
        }
    }

    MutationResponse {
        patched: current,
        patches: all_patches,
        applied,
        errors,
    }
}

/// Apply one rule's overlay then its literal patches.
fn apply_rule(
    current: &Value,
    spec: &MutationSpec,
) -> Result<(Value, Vec<PatchOperation>), EngineError> {
    if spec.overlay.is_none() && spec.patches.is_none() {
        return Err(EngineError::malformed(
            "mutate rule has neither overlay nor patches",
        ));
    }
    let mut document = current.clone();
    let mut ops = Vec::new();

    if let Some(overlay) = &spec.overlay {
        let overlay_ops = overlay_patches(&document, overlay)?;
        document = patches::apply(&document, &overlay_ops).map_err(|e| {
            EngineError::Fault(format!("overlay produced an inapplicable patch: {}", e))
        })?;
        ops.extend(overlay_ops);
    }
    if let Some(specs) = &spec.patches {
        let literal = patches::from_specs(specs)?;
        document = patches::apply(&document, &literal)?;
        ops.extend(literal);
    }
    Ok((document, ops))
}
