//! Cloud reconciliation error types

use std::time::Duration;
use thiserror::Error;

/// Cloud reconciliation errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Malformed resource identifier '{id}': {reason}")]
    MalformedIdentifier { id: String, reason: String },

    #[error("Resource identifier has no resourceGroups segment: {0}")]
    MissingResourceGroup(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Conflicting modification of {0}")]
    Conflict(String),

    #[error("Operation on {aggregate} failed: {source}")]
    OperationFailed {
        aggregate: String,
        #[source]
        source: Box<CloudError>,
    },

    #[error("Write to {aggregate} succeeded but '{name}' was not confirmed after {waited:?}: {reason}")]
    ConsistencyTimeout {
        aggregate: String,
        name: String,
        waited: Duration,
        /// Why the last re-read did not confirm the write
        reason: String,
    },

    #[error("'{name}' already exists in {aggregate} with different properties")]
    DuplicateName { aggregate: String, name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timed out acquiring lock {key} after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether re-running the whole upsert/remove can resolve the error.
    ///
    /// Only conflicts qualify: a retry re-fetches the aggregate and so picks up
    /// the concurrent modification that caused the rejection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Conflict(_))
    }

    /// Whether the aggregate mutation most likely applied on the remote side.
    pub fn write_may_have_applied(&self) -> bool {
        matches!(
            self,
            CloudError::ConsistencyTimeout { .. } | CloudError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
