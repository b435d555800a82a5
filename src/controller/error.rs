//! Error types for the controller.
//!
//! Defines error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::client;
use crate::engine::EngineError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Cluster API call failed
    #[error("Cluster API error: {0}")]
    Store(#[from] client::Error),

    /// Policy evaluation failed
    #[error("Policy evaluation failed: {0}")]
    Engine(#[from] EngineError),

    /// A reconciliation pass ran past its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(Duration),

    /// The Policy cache has not received its initial listing
    #[error("Policy cache not synced")]
    CacheNotSynced,
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_not_found())
    }

    /// Check if this error should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.is_retryable(),
            // the same input produces the same fault
            Error::Engine(_) => false,
            Error::Timeout(_) | Error::CacheNotSynced => true,
        }
    }

    /// Timeouts and an unsynced cache are requeued without consuming the
    /// retry budget.
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(self, Error::Timeout(_) | Error::CacheNotSynced)
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
