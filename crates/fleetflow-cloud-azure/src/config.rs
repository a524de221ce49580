//! Azure Resource Manager connection settings

use crate::error::{AzureError, Result};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";
pub const DEFAULT_API_VERSION: &str = "2023-09-01";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Configuration for the ARM load balancer store
#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// ARM endpoint, without trailing slash
    pub endpoint: String,
    /// Bearer token for ARM requests
    pub access_token: String,
    pub api_version: String,
    /// Fallback delay between operation polls when ARM sends no Retry-After
    pub poll_interval: Duration,
    /// Send `If-Match` with the fetched etag on submit
    pub use_etag: bool,
    /// Only accept identifiers in this subscription, when set
    pub subscription_id: Option<String>,
}

impl AzureConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            access_token: access_token.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            use_etag: false,
            subscription_id: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_etag(mut self, enabled: bool) -> Self {
        self.use_etag = enabled;
        self
    }

    /// Create AzureConfig from environment variables
    ///
    /// `ARM_ACCESS_TOKEN` is required. `ARM_ENDPOINT`, `ARM_API_VERSION`,
    /// `ARM_POLL_INTERVAL_MS`, `ARM_USE_ETAG` and `ARM_SUBSCRIPTION_ID` are
    /// optional.
    pub fn from_env() -> Result<Self> {
        let access_token = std::env::var("ARM_ACCESS_TOKEN")
            .map_err(|_| AzureError::MissingEnvVar("ARM_ACCESS_TOKEN".to_string()))?;

        let mut config = Self::new(access_token);
        if let Ok(endpoint) = std::env::var("ARM_ENDPOINT") {
            config = config.with_endpoint(endpoint);
        }
        if let Ok(api_version) = std::env::var("ARM_API_VERSION") {
            config.api_version = api_version;
        }
        if let Ok(raw) = std::env::var("ARM_POLL_INTERVAL_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                AzureError::InvalidConfig(format!("ARM_POLL_INTERVAL_MS: not a number: {}", raw))
            })?;
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("ARM_USE_ETAG") {
            config.use_etag = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.subscription_id = std::env::var("ARM_SUBSCRIPTION_ID").ok();

        Ok(config)
    }
}
