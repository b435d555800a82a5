//! JSON patch operations (RFC 6902 subset: add, replace, remove).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crd::PatchSpec;
use crate::engine::error::EngineError;

/// One patch operation, serialized in RFC 6902 form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Remove { path } => path,
        }
    }
}

/// Convert a rule's literal patch specs into operations.
pub fn from_specs(specs: &[PatchSpec]) -> Result<Vec<PatchOperation>, EngineError> {
    specs
        .iter()
        .map(|spec| {
            if !spec.path.starts_with('/') {
                return Err(EngineError::malformed(format!(
                    "patch path '{}' is not a JSON pointer",
                    spec.path
                )));
            }
            let path = spec.path.clone();
            let value = || {
                spec.value.clone().ok_or_else(|| {
                    EngineError::malformed(format!("'{}' at '{}' requires a value", spec.op, path))
                })
            };
            match spec.op.as_str() {
                "add" => Ok(PatchOperation::Add { path: path.clone(), value: value()? }),
                "replace" => Ok(PatchOperation::Replace { path: path.clone(), value: value()? }),
                "remove" => Ok(PatchOperation::Remove { path: path.clone() }),
                other => Err(EngineError::malformed(format!(
                    "unsupported patch operation '{}'",
                    other
                ))),
            }
        })
        .collect()
}

/// Convert operations into a `json_patch::Patch`.
pub fn to_json_patch(ops: &[PatchOperation]) -> Result<json_patch::Patch, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(ops)?)
}

/// Apply operations to a copy of `document`.
///
/// Fails as a whole if any operation fails; the input is never modified.
pub fn apply(document: &Value, ops: &[PatchOperation]) -> Result<Value, EngineError> {
    let patch = to_json_patch(ops)
        .map_err(|e| EngineError::malformed(format!("invalid patch document: {}", e)))?;
    let mut patched = document.clone();
    json_patch::patch(&mut patched, &patch.0)
        .map_err(|e| EngineError::malformed(format!("patch could not be applied: {}", e)))?;
    Ok(patched)
}
