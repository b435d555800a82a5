//! Webhook Server.
//!
//! - `admission`: pure admission decisions over the policy engine
//! - `tls`: key-pair providers
//! - `server`: the HTTPS endpoint with deadline and graceful stop

pub mod admission;
mod server;
mod tls;

use thiserror::Error;

pub use admission::{AdmissionDecision, Outcome, evaluate, evaluate_until};
pub use server::{
    DEFAULT_ADMISSION_BUDGET, WEBHOOK_PORT, WebhookState, admit, create_webhook_router, respond,
    run_webhook_server,
};
pub use tls::{FileKeyPair, KeyPair, KeyPairProvider};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};

/// Errors that can occur when running the webhook server
#[derive(Error, Debug)]
pub enum WebhookError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    /// Server error
    #[error("Webhook server error: {0}")]
    Server(String),
}
