//! Generation: derive requests for resources to create when a trigger matches.
//!
//! The engine only describes what to create. Callers check whether the
//! target already exists and create it otherwise, which keeps repeated runs
//! for the same (policy, trigger, rule) idempotent.

use serde_json::{Map, Value, json};

use crate::cache::PolicySnapshot;
use crate::crd::{CloneFrom, GenerationSpec, ResourceRef};
use crate::engine::error::{EngineError, RuleError};
use crate::engine::matching::rule_matches;

/// Label put on every generated object, holding the policy name.
pub const GENERATED_BY_LABEL: &str = "kubepolicy.nirmata.io/generated-by";
/// Annotation put on every generated object, holding the rule name.
pub const GENERATED_RULE_ANNOTATION: &str = "kubepolicy.nirmata.io/generated-rule";

/// Metadata fields populated by the API server, dropped when cloning.
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "generation",
    "managedFields",
    "ownerReferences",
    "selfLink",
    "finalizers",
];

/// Where the generated object's content comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationSource {
    /// Literal body merged into the object.
    Data(Value),
    /// Copy of an existing object.
    Clone(CloneFrom),
}

/// A resource to create.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub policy: String,
    pub rule: String,
    pub trigger: ResourceRef,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub source: GenerationSource,
}

impl GenerationRequest {
    /// Identity of the object to create.
    pub fn target(&self) -> ResourceRef {
        ResourceRef::new(&self.kind, self.namespace.as_deref(), &self.name)
    }

    /// Build the object body.
    ///
    /// `cloned` must be the source object for `GenerationSource::Clone` and
    /// is ignored otherwise. `apiVersion` is left to the caller, which knows
    /// the served version of `kind`.
    pub fn render(&self, cloned: Option<&Value>) -> Result<Value, EngineError> {
        let mut object = match &self.source {
            GenerationSource::Data(data) => match data {
                Value::Object(map) => map.clone(),
                Value::Null => Map::new(),
                _ => return Err(EngineError::malformed("generate data must be an object")),
            },
            GenerationSource::Clone(from) => {
                let source = cloned.ok_or_else(|| {
                    EngineError::Fault(format!(
                        "clone source {}/{} was not provided",
                        from.namespace, from.name
                    ))
                })?;
                let mut map = source.as_object().cloned().ok_or_else(|| {
                    EngineError::malformed("clone source is not an object")
                })?;
                map.remove("status");
                map
            }
        };

        let mut metadata = match object.remove("metadata") {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };
        for field in SERVER_METADATA {
            metadata.remove(*field);
        }
        metadata.insert("name".into(), json!(self.name));
        match &self.namespace {
            Some(ns) => metadata.insert("namespace".into(), json!(ns)),
            None => metadata.remove("namespace"),
        };
        insert_string(&mut metadata, "labels", GENERATED_BY_LABEL, &self.policy);
        insert_string(&mut metadata, "annotations", GENERATED_RULE_ANNOTATION, &self.rule);

        object.remove("apiVersion");
        object.insert("kind".into(), json!(self.kind));
        object.insert("metadata".into(), Value::Object(metadata));
        Ok(Value::Object(object))
    }
}

fn insert_string(metadata: &mut Map<String, Value>, field: &str, key: &str, value: &str) {
    let entry = metadata
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(map) = entry {
        map.insert(key.to_string(), json!(value));
    }
}

/// Result of a generation pass.
#[derive(Debug, Clone, Default)]
pub struct GenerationResponse {
    pub requests: Vec<GenerationRequest>,
    pub errors: Vec<RuleError>,
}

pub(crate) fn generate(resource: &Value, snapshot: &PolicySnapshot) -> GenerationResponse {
    let trigger = ResourceRef::from_object(resource);
    let mut response = GenerationResponse::default();

    for policy in snapshot.iter() {
        let policy_name = policy.metadata.name.clone().unwrap_or_default();
        for rule in &policy.spec.rules {
            let Some(spec) = &rule.generate else {
                continue;
            };
            let outcome = rule_matches(&rule.resource, resource)
                .and_then(|matched| matched.then(|| request_for(&policy_name, &rule.name, &trigger, spec)).transpose());
            match outcome {
                Ok(Some(request)) => response.requests.push(request),
                Ok(None) => {}
                Err(error) => response.errors.push(RuleError {
                    policy: policy_name.clone(),
                    rule: rule.name.clone(),
                    error,
                }),
            }
        }
    }
    response
}

fn request_for(
    policy: &str,
    rule: &str,
    trigger: &ResourceRef,
    spec: &GenerationSpec,
) -> Result<GenerationRequest, EngineError> {
    if spec.kind.is_empty() || spec.name.is_empty() {
        return Err(EngineError::malformed("generate rule requires kind and name"));
    }
    let source = match (&spec.data, &spec.clone) {
        (Some(_), Some(_)) => {
            return Err(EngineError::malformed(
                "generate rule sets both data and clone",
            ));
        }
        (Some(data), None) => GenerationSource::Data(data.clone()),
        (None, Some(from)) => GenerationSource::Clone(from.clone()),
        (None, None) => GenerationSource::Data(Value::Null),
    };
    let namespace = spec.namespace.clone().or_else(|| {
        if trigger.kind == "Namespace" {
            Some(trigger.name.clone())
        } else {
            trigger.namespace.clone()
        }
    });
    Ok(GenerationRequest {
        policy: policy.to_string(),
        rule: rule.to_string(),
        trigger: trigger.clone(),
        kind: spec.kind.clone(),
        name: spec.name.clone(),
        namespace,
        source,
    })
}
