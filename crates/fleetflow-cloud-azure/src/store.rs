//! Azure Resource Manager load balancer store
//!
//! Reads and writes whole load balancer documents through the ARM REST API.
//! A PUT starts a long-running operation which is tracked through the
//! `Azure-AsyncOperation` or `Location` response header.

use crate::config::AzureConfig;
use crate::error::{AzureError, Result};
use crate::wire;
use async_trait::async_trait;
use fleetflow_cloud::{
    AggregateResource, AggregateStore, CloudError, OperationHandle, ResourceIdentifier,
};
use reqwest::header::{HeaderMap, IF_MATCH, LOCATION, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

const ASYNC_OPERATION: &str = "azure-asyncoperation";

/// ARM error envelope
#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Body of an `Azure-AsyncOperation` status resource
#[derive(Debug, Default, Deserialize)]
struct OperationStatus {
    status: Option<String>,
    error: Option<ErrorBody>,
}

/// [`AggregateStore`] backed by ARM load balancers
pub struct AzureLoadBalancerStore {
    client: reqwest::Client,
    config: AzureConfig,
}

impl AzureLoadBalancerStore {
    pub fn new(config: AzureConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create a store from `ARM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AzureConfig::from_env()?))
    }

    pub fn config(&self) -> &AzureConfig {
        &self.config
    }

    fn resource_url(&self, id: &ResourceIdentifier) -> String {
        format!("{}{}", self.config.endpoint, id)
    }

    fn check_subscription(&self, id: &ResourceIdentifier) -> Result<()> {
        match &self.config.subscription_id {
            Some(expected) if !expected.eq_ignore_ascii_case(id.subscription_id()) => {
                Err(AzureError::InvalidConfig(format!(
                    "{} is outside subscription {}",
                    id, expected
                )))
            }
            _ => Ok(()),
        }
    }

    async fn get_document(&self, id: &ResourceIdentifier) -> Result<AggregateResource> {
        self.check_subscription(id)?;

        let response = self
            .client
            .get(self.resource_url(id))
            .query(&[("api-version", self.config.api_version.as_str())])
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AzureError::NotFound(id.to_string())),
            status if status.is_success() => {
                let document: Value = response.json().await?;
                wire::from_document(id, document)
            }
            status => Err(status_error(status, response).await),
        }
    }

    async fn put_document(&self, aggregate: &AggregateResource) -> Result<OperationHandle> {
        self.check_subscription(&aggregate.id)?;

        let mut request = self
            .client
            .put(self.resource_url(&aggregate.id))
            .query(&[("api-version", self.config.api_version.as_str())])
            .bearer_auth(&self.config.access_token)
            .json(&wire::to_document(aggregate));
        if self.config.use_etag {
            if let Some(etag) = &aggregate.etag {
                request = request.header(IF_MATCH, etag);
            }
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(AzureError::NotFound(aggregate.id.to_string())),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(AzureError::Conflict(aggregate.id.to_string()))
            }
            status if status.is_success() => {
                let handle = match operation_url(response.headers()) {
                    Some(url) => OperationHandle::pending(aggregate.id.clone(), url),
                    None => OperationHandle::completed(aggregate.id.clone()),
                };
                tracing::debug!(
                    aggregate = %aggregate.id,
                    status = status.as_u16(),
                    operation = handle.token.as_deref().unwrap_or("none"),
                    "Submitted load balancer"
                );
                Ok(handle)
            }
            status => Err(status_error(status, response).await),
        }
    }

    async fn wait_for_operation(
        &self,
        handle: &OperationHandle,
        url: &str,
        deadline: Instant,
    ) -> Result<()> {
        let still_running = || {
            AzureError::Timeout(format!(
                "operation {} on {} still running after {:?}",
                url,
                handle.aggregate,
                handle.elapsed()
            ))
        };
        loop {
            let response = tokio::time::timeout_at(
                deadline,
                self.client
                    .get(url)
                    .bearer_auth(&self.config.access_token)
                    .send(),
            )
            .await
            .map_err(|_| still_running())??;

            let status = response.status();
            let delay = retry_after(response.headers()).unwrap_or(self.config.poll_interval);

            if status == StatusCode::ACCEPTED {
                tracing::debug!(operation = url, "Operation accepted, still running");
            } else if status.is_success() {
                let text = response.text().await?;
                let body: OperationStatus = if text.trim().is_empty() {
                    OperationStatus::default()
                } else {
                    serde_json::from_str(&text)?
                };
                match body.status.as_deref() {
                    None => return Ok(()),
                    Some(s) if s.eq_ignore_ascii_case("Succeeded") => return Ok(()),
                    Some(s)
                        if s.eq_ignore_ascii_case("Failed") || s.eq_ignore_ascii_case("Canceled") =>
                    {
                        let error = body.error.unwrap_or_default();
                        return Err(AzureError::OperationFailed {
                            status: s.to_string(),
                            code: error.code,
                            message: error.message,
                        });
                    }
                    Some(s) => {
                        tracing::debug!(operation = url, status = s, "Operation still running");
                    }
                }
            } else {
                return Err(status_error(status, response).await);
            }

            let next = Instant::now() + delay;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(still_running());
            }
            tokio::time::sleep_until(next).await;
        }
    }
}

/// Polling URL of a long-running operation, preferring `Azure-AsyncOperation`
fn operation_url(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ASYNC_OPERATION)
        .or_else(|| headers.get(LOCATION))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// `Retry-After` in seconds
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn status_error(status: StatusCode, response: Response) -> AzureError {
    let text = response.text().await.unwrap_or_default();
    let envelope: ErrorEnvelope = serde_json::from_str(&text).unwrap_or_default();
    let message = if envelope.error.message.is_empty() {
        text
    } else {
        envelope.error.message
    };
    AzureError::Status {
        status: status.as_u16(),
        code: envelope.error.code,
        message,
    }
}

#[async_trait]
impl AggregateStore for AzureLoadBalancerStore {
    fn name(&self) -> &str {
        "azure-resource-manager"
    }

    async fn fetch(&self, id: &ResourceIdentifier) -> fleetflow_cloud::Result<AggregateResource> {
        Ok(self.get_document(id).await?)
    }

    async fn submit(
        &self,
        aggregate: &AggregateResource,
    ) -> fleetflow_cloud::Result<OperationHandle> {
        Ok(self.put_document(aggregate).await?)
    }

    async fn poll_until_done(
        &self,
        handle: OperationHandle,
        deadline: Instant,
    ) -> fleetflow_cloud::Result<()> {
        let Some(url) = handle.token.as_deref() else {
            return Ok(());
        };
        self.wait_for_operation(&handle, url, deadline)
            .await
            .map_err(CloudError::from)
    }
}
