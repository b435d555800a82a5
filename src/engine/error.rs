//! Engine error kinds.

use thiserror::Error;

/// Errors raised while evaluating a single rule.
///
/// A `MalformedPolicy` aborts only the rule it was raised for. A `Fault`
/// means an internal invariant was broken; callers treat it as a failure of
/// the whole evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unparsable pattern, overlay, patch or selector.
    #[error("malformed policy: {0}")]
    MalformedPolicy(String),

    /// Internal invariant broken during evaluation.
    #[error("engine fault: {0}")]
    Fault(String),
}

impl EngineError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        EngineError::MalformedPolicy(msg.into())
    }
}

/// An error attributed to one rule of one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleError {
    pub policy: String,
    pub rule: String,
    pub error: EngineError,
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "policy '{}' rule '{}': {}", self.policy, self.rule, self.error)
    }
}
