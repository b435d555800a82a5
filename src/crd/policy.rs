//! Policy Custom Resource Definition.
//!
//! A Policy is a cluster-scoped, ordered list of rules. Each rule selects
//! resources by kind, name, namespace and labels, and may mutate, validate
//! or generate resources. Rule order is evaluation order.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API group shared by all kube-policy resources.
pub const API_GROUP: &str = "kubepolicy.nirmata.io";

/// Policy is a custom resource describing admission rules.
///
/// Example:
/// ```yaml
/// apiVersion: kubepolicy.nirmata.io/v1alpha1
/// kind: Policy
/// metadata:
///   name: trusted-registry
/// spec:
///   validationFailureAction: enforce
///   rules:
///     - name: check-image
///       resource:
///         kinds: [Pod]
///         selector:
///           matchLabels:
///             app: foo
///       validate:
///         message: "Images must come from registry.example.com"
///         pattern:
///           spec:
///             containers:
///               - image: "registry.example.com/*"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubepolicy.nirmata.io",
    version = "v1alpha1",
    kind = "Policy",
    plural = "policies",
    shortname = "pol",
    printcolumn = r#"{"name":"Action", "type":"string", "jsonPath":".spec.validationFailureAction"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// What to do when a validation rule fails (default: enforce).
    #[serde(default)]
    pub validation_failure_action: FailureAction,

    /// Rules in evaluation order.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Whether failed validations block admission.
    pub fn is_enforcing(&self) -> bool {
        self.spec.validation_failure_action == FailureAction::Enforce
    }
}

/// Behaviour on validation failure.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Block the request.
    #[default]
    Enforce,
    /// Admit the request and record a violation.
    Audit,
}

impl std::fmt::Display for FailureAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureAction::Enforce => write!(f, "enforce"),
            FailureAction::Audit => write!(f, "audit"),
        }
    }
}

/// A single policy rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Rule name, unique within the policy.
    pub name: String,

    /// Which resources this rule applies to.
    pub resource: ResourceDescription,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate: Option<MutationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<ValidationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<GenerationSpec>,
}

/// Resource selection criteria for a rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    /// Resource kinds, matched exactly (e.g. `Pod`, `Deployment`).
    #[serde(default)]
    pub kinds: Vec<String>,

    /// Resource name, `*` and `?` wildcards allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Resource namespace, `*` and `?` wildcards allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Resources to exclude even when everything above matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<ExcludeResources>,
}

/// Exclusion criteria. A resource is excluded when any set criterion matches it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExcludeResources {
    #[serde(default)]
    pub kinds: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Kubernetes-style label selector.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A single label selector expression.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    /// One of `In`, `NotIn`, `Exists`, `DoesNotExist`.
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Mutation: an overlay document and/or literal JSON patch operations.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MutationSpec {
    /// Partial document merged onto the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub overlay: Option<Value>,

    /// Literal patch operations, applied after the overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<PatchSpec>>,
}

/// One literal patch operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    /// JSON pointer of the target location.
    pub path: String,
    /// `add`, `replace` or `remove`.
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<Value>,
}

/// Validation: a pattern plus optional alternatives.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSpec {
    /// Message reported when the rule fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub pattern: Option<Value>,

    /// The rule passes if any of these match.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub any_pattern: Vec<Value>,
}

impl ValidationSpec {
    /// Main pattern followed by alternatives, in evaluation order.
    pub fn candidates(&self) -> impl Iterator<Item = &Value> {
        self.pattern.iter().chain(self.any_pattern.iter())
    }
}

/// Generation: a template for a resource to create when a trigger matches.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSpec {
    pub kind: String,
    pub name: String,

    /// Target namespace. Defaults to the trigger's namespace, or the
    /// trigger's name when the trigger is a Namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Literal body merged into the generated object (e.g. `{"data": {...}}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub data: Option<Value>,

    /// Copy an existing object instead of using literal data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneFrom>,
}

/// Source object for clone-mode generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloneFrom {
    pub namespace: String,
    pub name: String,
}

fn preserve_unknown_fields(_: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject::default();
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    schema.into()
}
