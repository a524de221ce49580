//! Aggregate store contract
//!
//! The reconciliation engine never talks to a cloud API directly. Stores such
//! as the Azure Resource Manager client or [`crate::memory::InMemoryStore`]
//! implement this trait.

use crate::error::Result;
use crate::id::ResourceIdentifier;
use crate::model::AggregateResource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Remote store holding whole aggregates
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Returns the store name (e.g. "azure-resource-manager")
    fn name(&self) -> &str;

    /// Point-in-time read of the aggregate.
    ///
    /// Fails with [`crate::CloudError::ResourceNotFound`] if the aggregate does
    /// not exist.
    async fn fetch(&self, id: &ResourceIdentifier) -> Result<AggregateResource>;

    /// Start a full-replacement write of the aggregate.
    ///
    /// Fails with [`crate::CloudError::Conflict`] when the store detects a
    /// concurrent modification it cannot reconcile.
    async fn submit(&self, aggregate: &AggregateResource) -> Result<OperationHandle>;

    /// Wait until the operation reaches a terminal state or `deadline` passes.
    ///
    /// Returns the terminal error, if any. Passing the deadline yields
    /// [`crate::CloudError::Timeout`]; the operation's fate is then unknown.
    async fn poll_until_done(&self, handle: OperationHandle, deadline: Instant) -> Result<()>;
}

/// In-flight long-running operation returned by [`AggregateStore::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    /// Aggregate the operation writes
    pub aggregate: ResourceIdentifier,

    /// Store-specific token used to poll the operation; `None` when the
    /// submit completed synchronously
    pub token: Option<String>,

    /// When the submit was accepted
    pub started_at: DateTime<Utc>,
}

impl OperationHandle {
    pub fn pending(aggregate: ResourceIdentifier, token: impl Into<String>) -> Self {
        Self {
            aggregate,
            token: Some(token.into()),
            started_at: Utc::now(),
        }
    }

    pub fn completed(aggregate: ResourceIdentifier) -> Self {
        Self {
            aggregate,
            token: None,
            started_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.token.is_none()
    }

    /// Wall-clock time since the submit was accepted
    pub fn elapsed(&self) -> std::time::Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}
