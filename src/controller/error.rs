//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::mgmapi::MgmError;
use crate::mysqlclient::SqlError;
use crate::ndbconfig::ConfigError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The stored cluster configuration could not be parsed or generated.
    /// The operator wrote that config itself, so this is not retryable.
    #[error("cluster config error: {0}")]
    Config(#[from] ConfigError),

    /// Management server error
    #[error("management server error: {0}")]
    Mgm(#[from] MgmError),

    /// MySQL Server error
    #[error("MySQL error: {0}")]
    Sql(#[from] SqlError),

    /// Validation error in the resource spec
    #[error("validation error: {0}")]
    Validation(String),

    /// A spec update the operator cannot apply to a running cluster
    #[error("invalid spec update: {0}")]
    InvalidSpecUpdate(String),

    /// A resource with the expected name exists but is not owned by the
    /// NdbCluster
    #[error("resource {0} already exists and is not managed by this NdbCluster")]
    ResourceExists(String),

    /// Broken internal invariant
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and
                // server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            // Infrastructure that may simply not be up yet
            Error::Mgm(_) | Error::Sql(_) => true,
            Error::Validation(_)
            | Error::InvalidSpecUpdate(_)
            | Error::ResourceExists(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(5)
        } else {
            // Invariant violations are not retried eagerly; the next spec
            // change re-enqueues the resource anyway.
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
