// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for kube-policy.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components through the public API.

mod crd_tests {
    use kube::CustomResourceExt;
    use kube_policy::crd::{
        FailureAction, Policy, PolicySpec, PolicyViolation, ResourceRef, ViolationKey,
    };
    use serde_json::json;

    #[test]
    fn test_failure_action_serializes_lowercase() {
        assert_eq!(serde_json::to_value(FailureAction::Audit).unwrap(), json!("audit"));
        assert_eq!(FailureAction::Enforce.to_string(), "enforce");
    }

    #[test]
    fn test_missing_action_defaults_to_enforce() {
        let spec: PolicySpec = serde_json::from_value(json!({"rules": []})).unwrap();
        let policy = Policy::new("p", spec);
        assert!(policy.is_enforcing());
    }

    #[test]
    fn test_crds_are_cluster_scoped() {
        let policy = Policy::crd();
        assert_eq!(policy.spec.scope, "Cluster");
        assert_eq!(policy.spec.names.plural, "policies");
        assert_eq!(PolicyViolation::crd().spec.scope, "Cluster");
    }

    #[test]
    fn test_resource_ref_falls_back_to_generate_name() {
        let id = ResourceRef::from_object(&json!({
            "kind": "Pod",
            "metadata": {"generateName": "web-", "namespace": "default"}
        }));
        assert_eq!(id, ResourceRef::new("Pod", Some("default"), "web-"));
        assert_eq!(id.to_string(), "Pod/default/web-");
    }

    #[test]
    fn test_violation_name_is_stable_per_key() {
        let pod = ResourceRef::new("Pod", Some("default"), "web");
        let a = ViolationKey::new("trusted-registry", pod.clone(), "check-image");
        let b = ViolationKey::new("trusted-registry", pod.clone(), "check-image");
        let other_rule = ViolationKey::new("trusted-registry", pod, "check-tag");

        assert_eq!(a.object_name(), b.object_name());
        assert_ne!(a.object_name(), other_rule.object_name());
        assert!(a.object_name().starts_with("trusted-registry-"));
    }

    #[test]
    fn test_violation_record_round_trips_key() {
        let key = ViolationKey::new(
            "trusted-registry",
            ResourceRef::new("Namespace", None, "team-a"),
            "check-labels",
        );
        let record = PolicyViolation::for_key(&key, "label missing", "2026-01-01T00:00:00Z");
        assert_eq!(record.key(), key);
        assert_eq!(record.metadata.name.as_deref(), Some(key.object_name().as_str()));
        assert!(record.metadata.labels.unwrap().values().any(|v| v == "trusted-registry"));
    }
}

mod engine_tests {
    use kube_policy::PolicyEngine;
    use kube_policy::cache::PolicySnapshot;
    use kube_policy::crd::{
        FailureAction, Policy, PolicySpec, ResourceDescription, Rule, ValidationSpec,
    };
    use kube_policy::engine::EngineError;
    use serde_json::{Value, json};

    fn validating(action: FailureAction, pattern: Value, any_pattern: Vec<Value>) -> PolicySnapshot {
        PolicySnapshot::from_policies(vec![Policy::new(
            "limits",
            PolicySpec {
                validation_failure_action: action,
                rules: vec![Rule {
                    name: "check".into(),
                    resource: ResourceDescription {
                        kinds: vec!["Deployment".into()],
                        ..Default::default()
                    },
                    validate: Some(ValidationSpec {
                        message: None,
                        pattern: Some(pattern),
                        any_pattern,
                    }),
                    ..Default::default()
                }],
            },
        )])
    }

    fn deployment(replicas: i64, tag: &str) -> Value {
        json!({
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": replicas,
                "template": {"spec": {"containers": [{"image": format!("nginx:{}", tag)}]}}
            }
        })
    }

    #[test]
    fn test_numeric_operators() {
        let engine = PolicyEngine::new();
        let snapshot = validating(FailureAction::Enforce, json!({"spec": {"replicas": ">=2"}}), vec![]);
        assert!(!engine.validate(&deployment(3, "1.27"), &snapshot).is_blocked());
        let response = engine.validate(&deployment(1, "1.27"), &snapshot);
        assert!(response.is_blocked());
        assert_eq!(response.failures[0].path, "/spec/replicas");
    }

    #[test]
    fn test_negated_wildcard() {
        let engine = PolicyEngine::new();
        let snapshot = validating(
            FailureAction::Enforce,
            json!({"spec": {"template": {"spec": {"containers": [{"image": "!*:latest"}]}}}}),
            vec![],
        );
        assert!(!engine.validate(&deployment(1, "1.27"), &snapshot).is_blocked());
        assert!(engine.validate(&deployment(1, "latest"), &snapshot).is_blocked());
    }

    #[test]
    fn test_any_pattern_alternative_passes() {
        let engine = PolicyEngine::new();
        let snapshot = validating(
            FailureAction::Enforce,
            json!({"spec": {"replicas": ">5"}}),
            vec![json!({"spec": {"replicas": 1}})],
        );
        let response = engine.validate(&deployment(1, "1.27"), &snapshot);
        assert!(!response.is_blocked());
        assert_eq!(response.passed.len(), 1);
    }

    #[test]
    fn test_audit_failure_allows() {
        let engine = PolicyEngine::new();
        let snapshot = validating(FailureAction::Audit, json!({"spec": {"replicas": ">=2"}}), vec![]);
        let response = engine.validate(&deployment(1, "1.27"), &snapshot);
        assert!(!response.is_blocked());
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].action, FailureAction::Audit);
    }

    #[test]
    fn test_bad_operator_operand_is_malformed() {
        let engine = PolicyEngine::new();
        let snapshot = validating(FailureAction::Enforce, json!({"spec": {"replicas": ">many"}}), vec![]);
        let response = engine.validate(&deployment(1, "1.27"), &snapshot);
        assert!(!response.is_blocked());
        assert_eq!(response.errors.len(), 1);
        assert!(matches!(response.errors[0].error, EngineError::MalformedPolicy(_)));
    }

    #[test]
    fn test_non_matching_kind_is_ignored() {
        let engine = PolicyEngine::new();
        let snapshot = validating(FailureAction::Enforce, json!({"spec": {"replicas": ">=2"}}), vec![]);
        let pod = json!({"kind": "Pod", "metadata": {"name": "web"}, "spec": {"replicas": 1}});
        let response = engine.validate(&pod, &snapshot);
        assert!(response.failures.is_empty());
        assert!(response.passed.is_empty());
    }
}

mod queue_tests {
    use std::time::Duration;

    use kube_policy::controller::queue::{QueueConfig, WorkQueue};

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = QueueConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(2));
        assert_eq!(config.backoff(20), config.max_backoff);
    }

    #[tokio::test]
    async fn test_add_is_deduplicated() {
        let queue = WorkQueue::default();
        queue.add("p");
        queue.add("p");
        queue.add("q");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_handing_out_keys() {
        let queue = WorkQueue::default();
        queue.add("p");
        queue.shutdown();
        assert!(queue.next().await.is_none());
        queue.add("q");
        assert_eq!(queue.len(), 1);
    }
}

mod error_tests {
    use std::time::Duration;

    use kube_policy::client;
    use kube_policy::controller::error::Error;
    use kube_policy::engine::EngineError;

    #[test]
    fn test_timeout_is_retried_without_counting() {
        let err = Error::Timeout(Duration::from_secs(60));
        assert!(err.is_retryable());
        assert!(!err.counts_as_attempt());
    }

    #[test]
    fn test_engine_errors_are_not_retried() {
        let err = Error::from(EngineError::Fault("boom".into()));
        assert!(!err.is_retryable());
        assert!(err.counts_as_attempt());
    }

    #[test]
    fn test_store_errors_delegate() {
        let retry = Error::from(client::Error::UnknownKind("Widget".into()));
        let fatal = Error::from(client::Error::InvalidObject("no name".into()));
        assert!(retry.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!fatal.is_not_found());
    }
}

mod webhook_tests {
    use kube_policy::cache::PolicySnapshot;
    use kube_policy::crd::{FailureAction, Policy, PolicySpec, ResourceRef};
    use kube_policy::events::EventReason;
    use kube_policy::webhooks::{AdmissionDecision, Outcome};

    fn snapshot(action: FailureAction) -> PolicySnapshot {
        PolicySnapshot::from_policies(vec![Policy::new(
            "p",
            PolicySpec {
                validation_failure_action: action,
                rules: vec![],
            },
        )])
    }

    #[test]
    fn test_fault_denies_when_any_policy_enforces() {
        let pod = ResourceRef::new("Pod", Some("default"), "web");
        let decision = AdmissionDecision::fault(&pod, "boom", &snapshot(FailureAction::Enforce));
        assert!(!decision.allowed);
        assert_eq!(decision.outcome, Outcome::Faulted);
        assert_eq!(decision.reason.as_deref(), Some("InternalError"));
    }

    #[test]
    fn test_fault_admits_with_warning_under_audit() {
        let pod = ResourceRef::new("Pod", Some("default"), "web");
        let decision = AdmissionDecision::fault(&pod, "boom", &snapshot(FailureAction::Audit));
        assert!(decision.allowed);
        assert_eq!(decision.outcome.as_str(), "faulted");
        assert_eq!(decision.events.len(), 1);
        assert_eq!(decision.events[0].reason, EventReason::EngineFault);
    }
}

mod config_tests {
    use std::time::Duration;

    use clap::Parser;
    use kube_policy::config::{Config, parse_duration};

    #[test]
    fn test_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_default_budgets() {
        let config = Config::try_parse_from(["kube-policy"]).unwrap();
        assert_eq!(config.admission_timeout, Duration::from_secs(8));
        assert_eq!(config.webhook_addr().port(), kube_policy::WEBHOOK_PORT);
        assert_eq!(config.controller_settings().resync_period, Duration::from_secs(300));
    }
}
