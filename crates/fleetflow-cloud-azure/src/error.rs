//! Azure provider error types

use fleetflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AzureError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflicting modification of {0}")]
    Conflict(String),

    #[error("ARM request failed with HTTP {status}: {code}: {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Operation {status}: {code}: {message}")]
    OperationFailed {
        status: String,
        code: String,
        message: String,
    },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Cloud error: {0}")]
    CloudError(#[from] CloudError),
}

impl From<AzureError> for CloudError {
    fn from(err: AzureError) -> Self {
        match err {
            AzureError::NotFound(id) => CloudError::ResourceNotFound(id),
            AzureError::Conflict(id) => CloudError::Conflict(id),
            AzureError::Timeout(message) => CloudError::Timeout(message),
            AzureError::MissingEnvVar(name) => {
                CloudError::InvalidConfig(format!("missing environment variable {}", name))
            }
            AzureError::InvalidConfig(message) => CloudError::InvalidConfig(message),
            AzureError::JsonError(e) => CloudError::Json(e),
            AzureError::CloudError(e) => e,
            other => CloudError::ApiError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AzureError>;
