//! Custom Resource Definitions (CRDs) for kube-policy.
//!
//! - `Policy`: ordered mutate/validate/generate rules
//! - `PolicyViolation`: deduplicated record of a failing rule for one resource

mod policy;
mod policy_violation;

pub use policy::*;
pub use policy_violation::*;
