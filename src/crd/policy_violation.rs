//! PolicyViolation Custom Resource Definition.
//!
//! One PolicyViolation records that a resource currently fails one rule of one
//! policy. The object name is derived from the identity key, so the API
//! server itself guarantees at most one live record per key.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label carrying the owning policy name, used to list violations per policy.
pub const POLICY_LABEL: &str = "kubepolicy.nirmata.io/policy";

/// Maximum length of a Kubernetes label value.
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Namespace for UUID v5 violation names.
const VIOLATION_NAMESPACE: Uuid = Uuid::from_u128(0x6b75_6265_2d70_6f6c_6963_792d_7669_6f6c);

/// PolicyViolation records a failed validation rule for an existing resource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubepolicy.nirmata.io",
    version = "v1alpha1",
    kind = "PolicyViolation",
    plural = "policyviolations",
    shortname = "polv",
    printcolumn = r#"{"name":"Policy", "type":"string", "jsonPath":".spec.policy"}"#,
    printcolumn = r#"{"name":"Rule", "type":"string", "jsonPath":".spec.rule"}"#,
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.resource.kind"}"#,
    printcolumn = r#"{"name":"Resource", "type":"string", "jsonPath":".spec.resource.name"}"#,
    printcolumn = r#"{"name":"Last Seen", "type":"string", "jsonPath":".spec.lastSeen"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolationSpec {
    /// Name of the violated policy.
    pub policy: String,
    /// Name of the failing rule.
    pub rule: String,
    /// The offending resource.
    pub resource: ResourceRef,
    /// Human-readable failure message.
    pub message: String,
    /// When the failure was last observed (RFC 3339).
    pub last_seen: String,
}

/// Identity of a cluster resource.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Read the identity of a JSON object (`kind`, `metadata.namespace`,
    /// `metadata.name`, falling back to `metadata.generateName`).
    pub fn from_object(object: &serde_json::Value) -> Self {
        let metadata = object.get("metadata");
        let field = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
        };
        Self {
            kind: object
                .get("kind")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            namespace: field("namespace").map(str::to_string),
            name: field("name")
                .or_else(|| field("generateName"))
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Identity key of a violation: (policy, resource, rule).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ViolationKey {
    pub policy: String,
    pub resource: ResourceRef,
    pub rule: String,
}

impl ViolationKey {
    pub fn new(policy: &str, resource: ResourceRef, rule: &str) -> Self {
        Self {
            policy: policy.to_string(),
            resource,
            rule: rule.to_string(),
        }
    }

    /// Deterministic object name for this key.
    ///
    /// `<policy prefix>-<uuid v5 of the key>`; always a valid DNS subdomain
    /// as long as the policy name is one.
    pub fn object_name(&self) -> String {
        let raw = format!(
            "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
            self.policy,
            self.resource.kind,
            self.resource.namespace.as_deref().unwrap_or_default(),
            self.resource.name,
            self.rule
        );
        let id = Uuid::new_v5(&VIOLATION_NAMESPACE, raw.as_bytes());
        let prefix = label_safe(&self.policy, 200);
        format!("{}-{}", prefix, id.simple())
    }
}

impl std::fmt::Display for ViolationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} on {}", self.policy, self.rule, self.resource)
    }
}

impl PolicyViolation {
    /// Build a violation record for a key.
    pub fn for_key(key: &ViolationKey, message: &str, last_seen: &str) -> Self {
        let mut violation = PolicyViolation::new(
            &key.object_name(),
            PolicyViolationSpec {
                policy: key.policy.clone(),
                rule: key.rule.clone(),
                resource: key.resource.clone(),
                message: message.to_string(),
                last_seen: last_seen.to_string(),
            },
        );
        violation.metadata.labels = Some(
            [(POLICY_LABEL.to_string(), policy_label_value(&key.policy))]
                .into_iter()
                .collect(),
        );
        violation
    }

    /// Identity key of this record.
    pub fn key(&self) -> ViolationKey {
        ViolationKey::new(&self.spec.policy, self.spec.resource.clone(), &self.spec.rule)
    }
}

/// Label value for a policy name (truncated to the label length limit).
pub fn policy_label_value(policy: &str) -> String {
    label_safe(policy, MAX_LABEL_VALUE_LEN)
}

fn label_safe(value: &str, max: usize) -> String {
    let truncated: String = value.chars().take(max).collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
