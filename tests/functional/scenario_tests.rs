//! End-to-end scenarios through the admission path and the controller.
//!
//! Each test drives the production `admit`/`respond` and `reconcile`
//! functions against in-memory stores.

use serde_json::{Value, json};

use kube::api::DynamicObject;
use kube_policy::controller::reconciler::reconcile;
use kube_policy::crd::{ResourceRef, ViolationKey};
use kube_policy::engine::PatchOperation;
use kube_policy::events::EventReason;
use kube_policy::webhooks::{
    AdmissionRequest, AdmissionReview, DEFAULT_ADMISSION_BUDGET, Outcome, WebhookState, admit,
    respond,
};

use crate::common::fixtures::{
    PolicyBuilder, RuleBuilder, admission_review, pod, registry_rule,
};
use crate::mock_state::Harness;

fn request(operation: &str, object: &Value) -> AdmissionRequest<DynamicObject> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(admission_review(operation, object)).unwrap();
    review.try_into().unwrap()
}

fn webhook(harness: &Harness) -> WebhookState {
    WebhookState::new(harness.cache.clone(), DEFAULT_ADMISSION_BUDGET)
        .with_recorder(harness.recorder.clone())
}

#[tokio::test]
async fn test_enforced_policy_denies_untrusted_image() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("trusted-registry")
            .rule(registry_rule())
            .build(),
    );
    let state = webhook(&harness);
    let req = request("CREATE", &pod("default", "web", "docker.io/nginx"));

    let decision = admit(&state, &req).await;
    assert!(!decision.allowed);
    assert_eq!(decision.outcome, Outcome::Denied);
    let message = decision.message.clone().unwrap();
    assert!(message.contains("/spec/containers/0/image"), "{}", message);
    assert!(message.contains("trusted-registry"));

    let review = serde_json::to_value(respond(&req, &decision)).unwrap();
    assert_eq!(review["response"]["allowed"], json!(false));
    let status = review["response"]["status"]["message"].as_str().unwrap();
    assert!(status.starts_with("[RequestBlocked]"));
}

#[tokio::test]
async fn test_trusted_image_is_admitted_unchanged() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("trusted-registry")
            .rule(registry_rule())
            .build(),
    );
    let state = webhook(&harness);
    let req = request("CREATE", &pod("default", "web", "registry.example.com/nginx:1.27"));

    let decision = admit(&state, &req).await;
    assert!(decision.allowed);
    assert_eq!(decision.outcome, Outcome::Allowed);
    assert!(decision.patches.is_empty());

    let review = serde_json::to_value(respond(&req, &decision)).unwrap();
    assert!(review["response"].get("patch").is_none_or(Value::is_null));
}

#[tokio::test]
async fn test_audit_policy_admits_then_controller_records_violation() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("trusted-registry")
            .audit()
            .rule(registry_rule())
            .build(),
    );
    let state = webhook(&harness);
    let object = pod("default", "web", "docker.io/nginx");

    let decision = admit(&state, &request("CREATE", &object)).await;
    assert!(decision.allowed);
    assert!(decision.patches.is_empty());
    assert!(decision.nudges.contains("trusted-registry"));

    // the pod now exists; the background pass finds it
    harness.cluster.insert(object);
    let report = reconcile("trusted-registry", &harness.ctx).await.unwrap();
    assert_eq!(report.resources, 1);
    assert_eq!(report.recorded, 1);

    let records = harness.violations.all();
    assert_eq!(records.len(), 1);
    let expected = ViolationKey::new(
        "trusted-registry",
        ResourceRef::new("Pod", Some("default"), "web"),
        "check-registry",
    );
    assert_eq!(records[0].key(), expected);

    let events = harness.flush_events().await;
    assert!(
        events
            .iter()
            .any(|e| e.reason == EventReason::PolicyViolation
                && e.object.kind.as_deref() == Some("Policy"))
    );
}

#[tokio::test]
async fn test_overlay_adds_missing_label() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("add-owner")
            .rule(
                RuleBuilder::new("owner-label")
                    .kinds(&["Pod"])
                    .overlay(json!({"metadata": {"labels": {"owner": "team-x"}}}))
                    .build(),
            )
            .build(),
    );
    let state = webhook(&harness);
    let req = request("CREATE", &pod("default", "web", "nginx"));

    let decision = admit(&state, &req).await;
    assert!(decision.allowed);
    assert_eq!(decision.outcome, Outcome::Mutated);
    assert_eq!(
        decision.patches,
        vec![PatchOperation::Add {
            path: "/metadata/labels/owner".to_string(),
            value: json!("team-x"),
        }]
    );

    let review = serde_json::to_value(respond(&req, &decision)).unwrap();
    assert_eq!(review["response"]["patchType"], json!("JSONPatch"));

    let applied: Vec<_> = decision
        .events
        .iter()
        .filter(|e| e.reason == EventReason::PolicyApplied)
        .collect();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].message.contains("owner-label"));
}

#[tokio::test]
async fn test_overlay_is_noop_when_label_present() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("add-owner")
            .rule(
                RuleBuilder::new("owner-label")
                    .kinds(&["Pod"])
                    .overlay(json!({"metadata": {"labels": {"app": "foo"}}}))
                    .build(),
            )
            .build(),
    );
    let state = webhook(&harness);

    let decision = admit(&state, &request("CREATE", &pod("default", "web", "nginx"))).await;
    assert!(decision.allowed);
    assert_eq!(decision.outcome, Outcome::Allowed);
    assert!(decision.patches.is_empty());
}

#[tokio::test]
async fn test_deleting_policy_clears_only_its_violations() {
    let mut harness = Harness::new();
    let doomed = PolicyBuilder::new("trusted-registry")
        .audit()
        .rule(registry_rule())
        .build();
    let survivor = PolicyBuilder::new("trusted-registry-copy")
        .audit()
        .rule(registry_rule())
        .build();
    harness.apply_policy(doomed.clone());
    harness.apply_policy(survivor);
    harness.cluster.insert(pod("default", "web", "docker.io/nginx"));
    harness.cluster.insert(pod("team-a", "api", "quay.io/api"));

    reconcile("trusted-registry", &harness.ctx).await.unwrap();
    reconcile("trusted-registry-copy", &harness.ctx).await.unwrap();
    assert_eq!(harness.violations.for_policy("trusted-registry").len(), 2);
    assert_eq!(harness.violations.for_policy("trusted-registry-copy").len(), 2);

    harness.delete_policy(doomed);
    let report = reconcile("trusted-registry", &harness.ctx).await.unwrap();
    assert_eq!(report.cleared, 2);
    assert!(harness.violations.for_policy("trusted-registry").is_empty());
    assert_eq!(harness.violations.for_policy("trusted-registry-copy").len(), 2);
}

#[tokio::test]
async fn test_delete_requests_are_always_admitted() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("trusted-registry")
            .rule(registry_rule())
            .build(),
    );
    let state = webhook(&harness);

    let decision = admit(&state, &request("DELETE", &pod("default", "web", "docker.io/nginx"))).await;
    assert!(decision.allowed);
    assert!(decision.events.is_empty());
}

#[tokio::test]
async fn test_enforce_and_audit_failures_are_both_reported() {
    let mut harness = Harness::new();
    harness.apply_policy(
        PolicyBuilder::new("a-audit")
            .audit()
            .rule(registry_rule())
            .build(),
    );
    harness.apply_policy(
        PolicyBuilder::new("b-enforce")
            .rule(registry_rule())
            .build(),
    );
    let state = webhook(&harness);

    let decision = admit(&state, &request("CREATE", &pod("default", "web", "docker.io/nginx"))).await;
    assert!(!decision.allowed);
    assert!(decision.message.as_deref().unwrap().contains("b-enforce"));
    assert!(decision.nudges.contains("a-audit"));

    let reasons: Vec<_> = decision.events.iter().map(|e| e.reason).collect();
    assert!(reasons.contains(&EventReason::RequestBlocked));
    assert!(reasons.contains(&EventReason::PolicyViolation));
}
