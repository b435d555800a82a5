//! Policy Engine.
//!
//! Pure evaluation of policies against a resource: mutation patches,
//! validation verdicts and generation requests. The engine keeps no state
//! between calls; every call works on the resource and the policy snapshot
//! it is given, so one instance can be shared by any number of callers.

pub mod error;
pub mod generation;
pub mod matching;
pub mod mutation;
pub mod overlay;
pub mod patches;
pub mod pattern;
pub mod validation;

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;

use crate::cache::PolicySnapshot;

pub use error::{EngineError, RuleError};
pub use generation::{GenerationRequest, GenerationResponse, GenerationSource};
pub use mutation::{AppliedRule, MutationResponse};
pub use patches::PatchOperation;
pub use validation::{RuleFailure, RulePass, ValidationResponse, Verdict};

/// Stateless policy evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Apply every matching mutation rule, in policy then rule order, to the
    /// accumulating resource. A failing rule is skipped and reported in
    /// `errors`; the pass continues.
    pub fn mutate(&self, resource: &Value, snapshot: &PolicySnapshot) -> MutationResponse {
        mutation::mutate(resource, snapshot)
    }

    /// Admission validation: stops at the first failure of an enforcing
    /// policy. Failures of auditing policies accumulate.
    pub fn validate(&self, resource: &Value, snapshot: &PolicySnapshot) -> ValidationResponse {
        validation::validate(resource, snapshot, true)
    }

    /// Exhaustive validation: evaluates every rule, used for background
    /// reconciliation where each failure is recorded.
    pub fn audit(&self, resource: &Value, snapshot: &PolicySnapshot) -> ValidationResponse {
        validation::validate(resource, snapshot, false)
    }

    /// Describe resources to create for matching generate rules.
    pub fn generate(&self, resource: &Value, snapshot: &PolicySnapshot) -> GenerationResponse {
        generation::generate(resource, snapshot)
    }
}

/// Run an evaluation, converting a panic into `EngineError::Fault`.
pub fn guarded<T>(evaluation: impl FnOnce() -> T) -> Result<T, EngineError> {
    catch_unwind(AssertUnwindSafe(evaluation)).map_err(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        EngineError::Fault(detail)
    })
}
