//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the policy cache is synced)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for admission metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdmissionLabels {
    pub operation: String,
    pub outcome: String,
}

impl EncodeLabelSet for AdmissionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-policy reconciliation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PolicyLabels {
    pub policy: String,
}

impl EncodeLabelSet for PolicyLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("policy", self.policy.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics
pub struct Metrics {
    /// Admission requests by operation and outcome
    pub admissions_total: Family<AdmissionLabels, Counter>,
    /// Admission handling latency
    pub admission_duration_seconds: Histogram,
    /// Total reconciliations counter
    pub reconciliations_total: Family<PolicyLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<PolicyLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<PolicyLabels, Histogram>,
    /// Events waiting in the recorder queue
    pub event_queue_depth: Gauge,
    /// Events dropped after exhausting retries
    pub events_dropped_total: Counter,
    /// Policies currently cached
    pub policies_cached: Gauge,
    /// Unix time of the last successful reconciliation
    pub last_reconcile_timestamp_seconds: Gauge,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admissions_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "kubepolicy_admissions",
            "Total number of admission requests by outcome",
            admissions_total.clone(),
        );

        let admission_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 16));
        registry.register(
            "kubepolicy_admission_duration_seconds",
            "Duration of admission handling in seconds",
            admission_duration_seconds.clone(),
        );

        let reconciliations_total = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "kubepolicy_reconciliations",
            "Total number of policy reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "kubepolicy_reconciliation_errors",
            "Total number of policy reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<PolicyLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "kubepolicy_reconcile_duration_seconds",
            "Duration of policy reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let event_queue_depth = Gauge::default();
        registry.register(
            "kubepolicy_event_queue_depth",
            "Number of events waiting to be written",
            event_queue_depth.clone(),
        );

        let events_dropped_total = Counter::default();
        registry.register(
            "kubepolicy_events_dropped",
            "Total number of events dropped after retries",
            events_dropped_total.clone(),
        );

        let policies_cached = Gauge::default();
        registry.register(
            "kubepolicy_policies_cached",
            "Number of policies in the cache",
            policies_cached.clone(),
        );

        let last_reconcile_timestamp_seconds = Gauge::default();
        registry.register(
            "kubepolicy_last_reconcile_timestamp_seconds",
            "Unix time of the last successful policy reconciliation",
            last_reconcile_timestamp_seconds.clone(),
        );

        Self {
            admissions_total,
            admission_duration_seconds,
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            event_queue_depth,
            events_dropped_total,
            policies_cached,
            last_reconcile_timestamp_seconds,
            registry,
        }
    }

    /// Record one admission decision
    pub fn record_admission(&self, operation: &str, outcome: &str, duration_secs: f64) {
        let labels = AdmissionLabels {
            operation: operation.to_string(),
            outcome: outcome.to_string(),
        };
        self.admissions_total.get_or_create(&labels).inc();
        self.admission_duration_seconds.observe(duration_secs);
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, policy: &str, duration_secs: f64) {
        let labels = PolicyLabels {
            policy: policy.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
        self.last_reconcile_timestamp_seconds
            .set(jiff::Timestamp::now().as_second());
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, policy: &str) {
        let labels = PolicyLabels {
            policy: policy.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    pub fn set_event_queue_depth(&self, depth: usize) {
        self.event_queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped_total.inc();
    }

    pub fn set_policies_cached(&self, count: usize) {
        self.policies_cached
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the process is ready (policy cache synced, webhook serving)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the process as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the process is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the policy cache has synced.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:<port>`.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
