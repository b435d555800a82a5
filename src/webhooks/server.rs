//! Admission webhook server.
//!
//! Serves `POST /mutate` over TLS. Every CREATE and UPDATE is evaluated
//! against the current policy snapshot on the blocking pool under an
//! internal deadline shorter than the API server's. Events and controller
//! nudges are handed off without waiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::WebhookError;
use super::admission::{self, AdmissionDecision};
use super::tls::KeyPairProvider;
use crate::cache::PolicyCache;
use crate::controller::queue::WorkQueue;
use crate::crd::ResourceRef;
use crate::engine::{PolicyEngine, guarded, patches};
use crate::events::EventRecorder;
use crate::health::HealthState;

/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Default evaluation budget, under the API server's 10s timeout.
pub const DEFAULT_ADMISSION_BUDGET: Duration = Duration::from_secs(8);

/// Delay before a nudged policy is reconciled, so the admitted object exists.
const NUDGE_DELAY: Duration = Duration::from_secs(2);

/// Shared state for webhook handlers
pub struct WebhookState {
    pub engine: PolicyEngine,
    pub cache: PolicyCache,
    recorder: Option<EventRecorder>,
    queue: Option<WorkQueue>,
    health: Option<Arc<HealthState>>,
    budget: Duration,
}

impl WebhookState {
    pub fn new(cache: PolicyCache, budget: Duration) -> Self {
        Self {
            engine: PolicyEngine::new(),
            cache,
            recorder: None,
            queue: None,
            health: None,
            budget,
        }
    }

    pub fn with_recorder(mut self, recorder: EventRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_queue(mut self, queue: WorkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// Hand off events and nudges of a decision. Never blocks.
    fn dispatch(&self, decision: &AdmissionDecision) {
        if let Some(recorder) = &self.recorder {
            for event in &decision.events {
                recorder.emit(event.clone());
            }
        }
        if let Some(queue) = &self.queue {
            for policy in &decision.nudges {
                queue.add_after(policy, NUDGE_DELAY);
            }
        }
    }
}

fn operation_name(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

/// Create a denial response with reason embedded in message.
/// kube-rs deny() only sets status.message, so we format as "[reason] message"
fn deny_with_reason(
    request: &AdmissionRequest<DynamicObject>,
    message: &str,
    reason: &str,
) -> AdmissionReview<DynamicObject> {
    let full_message = format!("[{}] {}", reason, message);
    AdmissionResponse::from(request)
        .deny(full_message)
        .into_review()
}

/// The object under admission as JSON, with identity fields the API server
/// leaves out of the body filled in from the request.
fn request_object(request: &AdmissionRequest<DynamicObject>) -> Result<Value, String> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| "missing object in request".to_string())?;
    let mut value = serde_json::to_value(object).map_err(|e| e.to_string())?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| "object is not a JSON object".to_string())?;
    if !map.contains_key("kind") {
        map.insert("kind".into(), Value::String(request.kind.kind.clone()));
    }
    let metadata = map
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    if let (Some(metadata), Some(namespace)) = (metadata.as_object_mut(), &request.namespace)
        && !metadata.contains_key("namespace")
    {
        metadata.insert("namespace".into(), Value::String(namespace.clone()));
    }
    Ok(value)
}

/// Decide one admission request.
pub async fn admit(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionDecision {
    if matches!(request.operation, Operation::Delete | Operation::Connect) {
        return AdmissionDecision::allow();
    }

    let snapshot = state.cache.snapshot();
    let resource = match request_object(request) {
        Ok(resource) => resource,
        Err(detail) => {
            let identity = ResourceRef::new(
                &request.kind.kind,
                request.namespace.as_deref(),
                &request.name,
            );
            return AdmissionDecision::fault(&identity, &detail, &snapshot);
        }
    };
    let identity = ResourceRef::from_object(&resource);

    let engine = state.engine;
    let task_snapshot = snapshot.clone();
    let deadline = Instant::now().checked_add(state.budget);
    let task = tokio::task::spawn_blocking(move || {
        guarded(|| admission::evaluate_until(&engine, &resource, &task_snapshot, deadline))
    });
    match tokio::time::timeout(state.budget, task).await {
        Ok(Ok(Ok(decision))) => decision,
        Ok(Ok(Err(fault))) => AdmissionDecision::fault(&identity, &fault.to_string(), &snapshot),
        Ok(Err(join_error)) => {
            AdmissionDecision::fault(&identity, &join_error.to_string(), &snapshot)
        }
        Err(_) => AdmissionDecision::fault(
            &identity,
            &format!("evaluation exceeded {:?}", state.budget),
            &snapshot,
        ),
    }
}

/// Build the review returned to the API server.
pub fn respond(
    request: &AdmissionRequest<DynamicObject>,
    decision: &AdmissionDecision,
) -> AdmissionReview<DynamicObject> {
    if !decision.allowed {
        return deny_with_reason(
            request,
            decision.message.as_deref().unwrap_or("request denied"),
            decision.reason.as_deref().unwrap_or("RequestBlocked"),
        );
    }
    let response = AdmissionResponse::from(request);
    if decision.patches.is_empty() {
        return response.into_review();
    }
    let patched = patches::to_json_patch(&decision.patches)
        .map_err(|e| e.to_string())
        .and_then(|patch| response.with_patch(patch).map_err(|e| e.to_string()));
    match patched {
        Ok(response) => response.into_review(),
        Err(e) => {
            error!(uid = %request.uid, error = %e, "Failed to serialize patch");
            deny_with_reason(request, admission::INTERNAL_ERROR_MESSAGE, "InternalError")
        }
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .with_state(state)
}

/// Admission handler
async fn mutate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let start = Instant::now();
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    let uid = &request.uid;
    let operation = operation_name(&request.operation);
    debug!(
        uid = %uid,
        operation,
        kind = %request.kind.kind,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );

    let decision = admit(&state, &request).await;
    state.dispatch(&decision);

    let elapsed = start.elapsed();
    if let Some(health) = &state.health {
        health
            .metrics
            .record_admission(operation, decision.outcome.as_str(), elapsed.as_secs_f64());
    }
    if decision.allowed {
        info!(
            uid = %uid,
            operation,
            outcome = decision.outcome.as_str(),
            patches = decision.patches.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Admission request allowed"
        );
    } else {
        warn!(
            uid = %uid,
            operation,
            message = ?decision.message,
            duration_ms = elapsed.as_millis() as u64,
            "Admission request denied"
        );
    }
    (StatusCode::OK, Json(respond(&request, &decision)))
}

/// Run the webhook server with TLS until `shutdown` turns true.
///
/// On shutdown the listener stops accepting, in-flight requests get `grace`
/// to finish, then the server returns.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    keys: &dyn KeyPairProvider,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> Result<(), WebhookError> {
    let pair = keys.key_pair().await?;
    let config = RustlsConfig::from_pem(pair.cert_pem, pair.key_pem)
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let handle = Handle::new();
    stop_on_shutdown(handle.clone(), shutdown, grace);

    let app = create_webhook_router(state);
    info!(port = addr.port(), "Webhook server listening with TLS");
    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    info!("Webhook server stopped");
    Ok(())
}

/// Begin a graceful stop of the server behind `handle` once `shutdown`
/// turns true.
fn stop_on_shutdown(handle: Handle, shutdown: watch::Receiver<bool>, grace: Duration) {
    tokio::spawn(async move {
        crate::wait_for_shutdown(shutdown).await;
        info!(grace_secs = grace.as_secs(), "Stopping webhook server");
        handle.graceful_shutdown(Some(grace));
    });
}
