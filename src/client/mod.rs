//! Cluster object store interface.
//!
//! The controller reads and creates arbitrary kinds (whatever policies name),
//! so objects travel as JSON documents. `KubeClusterStore` implements the
//! interface against the API server using discovery to resolve kinds.

mod kube_store;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use kube_store::KubeClusterStore;

/// Errors from cluster API calls.
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// No served resource has this kind
    #[error("Unknown resource kind: {0}")]
    UnknownKind(String),

    /// Object could not be converted
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object is missing required fields
    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Network errors, throttling and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            // discovery may catch up with newly installed CRDs
            Error::UnknownKind(_) => true,
            Error::Serialization(_) | Error::InvalidObject(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Generic access to cluster objects by kind, namespace and name.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List objects of `kind`, in `namespace` or cluster-wide.
    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>>;

    /// Fetch one object; `Ok(None)` if it does not exist.
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<Value>>;

    /// Create an object. `apiVersion` is filled in from the served version of `kind`.
    async fn create(&self, kind: &str, namespace: Option<&str>, object: Value) -> Result<Value>;
}
