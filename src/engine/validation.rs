//! Validation: test matching rules' patterns and derive a verdict.

use serde_json::Value;

use crate::cache::PolicySnapshot;
use crate::crd::{FailureAction, ResourceRef};
use crate::engine::error::RuleError;
use crate::engine::matching::rule_matches;
use crate::engine::pattern::{MatchError, match_any};

/// Admission verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { message: String },
}

/// A rule the resource failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub policy: String,
    pub rule: String,
    pub action: FailureAction,
    pub message: String,
    /// JSON pointer of the first mismatching field.
    pub path: String,
}

/// A rule the resource satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePass {
    pub policy: String,
    pub rule: String,
}

/// Result of a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationResponse {
    pub verdict: Verdict,
    pub failures: Vec<RuleFailure>,
    pub passed: Vec<RulePass>,
    pub errors: Vec<RuleError>,
}

impl ValidationResponse {
    pub fn is_blocked(&self) -> bool {
        matches!(self.verdict, Verdict::Deny { .. })
    }
}

/// Evaluate validation rules.
///
/// With `short_circuit`, the first failure of an enforcing policy stops the
/// pass. Otherwise every rule of every policy is evaluated.
pub(crate) fn validate(
    resource: &Value,
    snapshot: &PolicySnapshot,
    short_circuit: bool,
) -> ValidationResponse {
    let identity = ResourceRef::from_object(resource);
    let mut response = ValidationResponse {
        verdict: Verdict::Allow,
        failures: Vec::new(),
        passed: Vec::new(),
        errors: Vec::new(),
    };

    for policy in snapshot.iter() {
        let policy_name = policy.metadata.name.clone().unwrap_or_default();
        let action = policy.spec.validation_failure_action;
        for rule in &policy.spec.rules {
            let Some(spec) = &rule.validate else {
                continue;
            };
            let rule_error = |error| RuleError {
                policy: policy_name.clone(),
                rule: rule.name.clone(),
                error,
            };
            match rule_matches(&rule.resource, resource) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    response.errors.push(rule_error(e));
                    continue;
                }
            }
            match match_any(resource, spec.candidates()) {
                Ok(()) => response.passed.push(RulePass {
                    policy: policy_name.clone(),
                    rule: rule.name.clone(),
                }),
                Err(MatchError::Malformed(e)) => response.errors.push(rule_error(e)),
                Err(MatchError::Mismatch(mismatch)) => {
                    let message = format!(
                        "Validation rule '{}' of policy '{}' failed for {}: {}; {}",
                        rule.name,
                        policy_name,
                        identity,
                        spec.message
                            .as_deref()
                            .unwrap_or("resource does not match the pattern"),
                        mismatch
                    );
                    if action == FailureAction::Enforce
                        && response.verdict == Verdict::Allow
                    {
                        response.verdict = Verdict::Deny {
                            message: message.clone(),
                        };
                    }
                    response.failures.push(RuleFailure {
                        policy: policy_name.clone(),
                        rule: rule.name.clone(),
                        action,
                        message,
                        path: mismatch.path,
                    });
                    if short_circuit && action == FailureAction::Enforce {
                        return response;
                    }
                }
            }
        }
    }
    response
}
