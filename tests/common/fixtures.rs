//! Test fixtures and builder patterns for policies and resources.

use kube_policy::crd::{
    FailureAction, GenerationSpec, LabelSelector, MutationSpec, Policy, PolicySpec, Rule,
    ValidationSpec,
};
use serde_json::{Value, json};

/// Builder for creating Policy test fixtures.
///
/// # Example
/// ```
/// let policy = PolicyBuilder::new("trusted-registry")
///     .audit()
///     .rule(RuleBuilder::new("check-image").kinds(&["Pod"]).pattern(json!({})).build())
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct PolicyBuilder {
    name: String,
    action: FailureAction,
    rules: Vec<Rule>,
}

impl PolicyBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: FailureAction::Enforce,
            rules: Vec::new(),
        }
    }

    pub fn audit(mut self) -> Self {
        self.action = FailureAction::Audit;
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> Policy {
        Policy::new(
            &self.name,
            PolicySpec {
                validation_failure_action: self.action,
                rules: self.rules,
            },
        )
    }
}

/// Builder for a single rule.
#[derive(Clone, Debug)]
pub struct RuleBuilder {
    rule: Rule,
}

impl RuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            rule: Rule {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn kinds(mut self, kinds: &[&str]) -> Self {
        self.rule.resource.kinds = kinds.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn match_labels(mut self, labels: &[(&str, &str)]) -> Self {
        self.rule.resource.selector = Some(LabelSelector {
            match_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        });
        self
    }

    pub fn pattern(mut self, pattern: Value) -> Self {
        self.rule.validate = Some(ValidationSpec {
            message: Some("image must come from registry.example.com".to_string()),
            pattern: Some(pattern),
            any_pattern: vec![],
        });
        self
    }

    pub fn overlay(mut self, overlay: Value) -> Self {
        self.rule.mutate = Some(MutationSpec {
            overlay: Some(overlay),
            patches: None,
        });
        self
    }

    pub fn generate(mut self, spec: GenerationSpec) -> Self {
        self.rule.generate = Some(spec);
        self
    }

    pub fn build(self) -> Rule {
        self.rule
    }
}

/// The trusted-registry rule: Pods labelled `app=foo` must pull from
/// `registry.example.com`.
pub fn registry_rule() -> Rule {
    RuleBuilder::new("check-registry")
        .kinds(&["Pod"])
        .match_labels(&[("app", "foo")])
        .pattern(json!({"spec": {"containers": [{"image": "registry.example.com/*"}]}}))
        .build()
}

pub fn pod(namespace: &str, name: &str, image: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {"app": "foo"}
        },
        "spec": {"containers": [{"name": "main", "image": image}]}
    })
}

pub fn namespace(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name}
    })
}

pub fn config_map(namespace: &str, name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": namespace},
        "data": data
    })
}

/// Wrap an object in an `admission.k8s.io/v1` AdmissionReview.
pub fn admission_review(operation: &str, object: &Value) -> Value {
    let kind = object["kind"].as_str().unwrap_or_default();
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "2b752327-a529-4ffd-b2e2-478455e80a0d",
            "kind": {"group": "", "version": "v1", "kind": kind},
            "resource": {"group": "", "version": "v1", "resource": format!("{}s", kind.to_lowercase())},
            "name": object["metadata"]["name"],
            "namespace": object["metadata"]["namespace"],
            "operation": operation,
            "userInfo": {"username": "kubernetes-admin"},
            "object": object,
            "dryRun": false
        }
    })
}
