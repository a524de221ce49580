//! Shared-aggregate reconciliation
//!
//! Every mutation runs as one serialized read-modify-write cycle:
//!
//! ```text
//! lock(kind.name) ─▶ fetch ─▶ locate / mutate ─▶ submit ─▶ poll ─▶ re-fetch until visible ─▶ unlock
//! ```
//!
//! The aggregate is always re-read under the lock, so two callers touching
//! different entries of the same aggregate never lose each other's writes.
//! Locks are RAII guards and are released on every exit path, including
//! cancellation of the calling task.

use crate::config::{DuplicatePolicy, ReconcilerConfig};
use crate::error::{CloudError, Result};
use crate::id::ResourceIdentifier;
use crate::lock::{LockGuard, LockKey, LockRegistry, MultiLockGuard};
use crate::locator;
use crate::model::{AggregateResource, CollectionKind, SubResource};
use crate::store::AggregateStore;
use std::sync::Arc;
use tokio::time::Instant;

/// A single sub-resource mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert {
        id: ResourceIdentifier,
        resource: SubResource,
    },
    Remove {
        id: ResourceIdentifier,
        kind: CollectionKind,
        name: String,
    },
}

impl Change {
    pub fn upsert(id: ResourceIdentifier, resource: SubResource) -> Self {
        Change::Upsert { id, resource }
    }

    pub fn remove(id: ResourceIdentifier, kind: CollectionKind, name: impl Into<String>) -> Self {
        Change::Remove {
            id,
            kind,
            name: name.into(),
        }
    }

    /// Aggregate the change applies to
    pub fn aggregate(&self) -> &ResourceIdentifier {
        match self {
            Change::Upsert { id, .. } | Change::Remove { id, .. } => id,
        }
    }

    fn target(&self) -> (CollectionKind, &str) {
        match self {
            Change::Upsert { resource, .. } => (resource.kind(), resource.name()),
            Change::Remove { kind, name, .. } => (*kind, name),
        }
    }
}

/// State a change should leave behind once visible
struct Expectation<'a> {
    kind: CollectionKind,
    name: &'a str,
    value: Option<&'a SubResource>,
}

impl Expectation<'_> {
    fn is_met(&self, aggregate: &AggregateResource) -> bool {
        let current = aggregate.find(self.kind, self.name).map(|(_, sub)| sub);
        match (self.value, current) {
            (Some(expected), Some(current)) => expected.matches(current),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Reconciliation engine over one [`AggregateStore`]
///
/// The lock registry is injected so that every engine in the process, and
/// only those, share the same mutual-exclusion domain.
pub struct Reconciler {
    store: Arc<dyn AggregateStore>,
    locks: Arc<LockRegistry>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AggregateStore>, locks: Arc<LockRegistry>) -> Self {
        Self {
            store,
            locks,
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Create or replace `resource` inside the aggregate `id`.
    ///
    /// An existing entry with the same name is replaced in place; otherwise the
    /// resource is appended. Duplicate names follow the configured
    /// [`DuplicatePolicy`].
    pub async fn upsert(&self, id: &ResourceIdentifier, resource: SubResource) -> Result<()> {
        self.upsert_with(id, resource, self.config.duplicate_policy)
            .await
    }

    #[tracing::instrument(
        skip_all,
        fields(aggregate = %id, kind = %resource.kind(), name = %resource.name())
    )]
    pub async fn upsert_with(
        &self,
        id: &ResourceIdentifier,
        resource: SubResource,
        policy: DuplicatePolicy,
    ) -> Result<()> {
        let _guard = self.lock(&LockKey::for_aggregate(id)).await?;
        let change = Change::upsert(id.clone(), resource);
        self.reconcile(id, &[&change], policy).await
    }

    /// Remove the sub-resource `name` from the aggregate `id`.
    ///
    /// Removing an entry that is already absent succeeds without writing.
    #[tracing::instrument(skip_all, fields(aggregate = %id, kind = %kind, name = %name))]
    pub async fn remove(
        &self,
        id: &ResourceIdentifier,
        kind: CollectionKind,
        name: &str,
    ) -> Result<()> {
        let _guard = self.lock(&LockKey::for_aggregate(id)).await?;
        let change = Change::remove(id.clone(), kind, name);
        self.reconcile(id, &[&change], self.config.duplicate_policy)
            .await
    }

    /// Apply a batch of changes that may span several aggregates.
    ///
    /// All affected aggregates are locked up front, then each aggregate gets a
    /// single fetch/submit/poll cycle in the order it first appears. There is
    /// no rollback: on error, aggregates already processed stay committed.
    #[tracing::instrument(skip_all, fields(changes = changes.len()))]
    pub async fn apply(&self, changes: Vec<Change>) -> Result<()> {
        let mut groups: Vec<(ResourceIdentifier, Vec<&Change>)> = Vec::new();
        for change in &changes {
            let id = change.aggregate();
            match groups
                .iter_mut()
                .find(|(existing, _)| locator::names_equal(&existing.to_string(), &id.to_string()))
            {
                Some((_, group)) => group.push(change),
                None => groups.push((id.clone(), vec![change])),
            }
        }

        let keys: Vec<LockKey> = groups
            .iter()
            .map(|(id, _)| LockKey::for_aggregate(id))
            .collect();
        let _guard = self.lock_all(&keys).await?;

        for (id, group) in &groups {
            self.reconcile(id, group, self.config.duplicate_policy)
                .await?;
        }
        Ok(())
    }

    async fn lock(&self, key: &LockKey) -> Result<LockGuard> {
        match self.config.lock_timeout() {
            Some(timeout) => self.locks.acquire_timeout(key, timeout).await,
            None => Ok(self.locks.acquire(key).await),
        }
    }

    async fn lock_all(&self, keys: &[LockKey]) -> Result<MultiLockGuard> {
        match self.config.lock_timeout() {
            Some(timeout) => self.locks.acquire_all_timeout(keys, timeout).await,
            None => Ok(self.locks.acquire_all(keys).await),
        }
    }

    /// One read-modify-write cycle. Callers must hold the aggregate's lock.
    async fn reconcile(
        &self,
        id: &ResourceIdentifier,
        changes: &[&Change],
        policy: DuplicatePolicy,
    ) -> Result<()> {
        let mut aggregate = self.store.fetch(id).await?;
        tracing::debug!(
            "Fetched {} from {} (etag {:?})",
            id,
            self.store.name(),
            aggregate.etag
        );

        let mut dirty = false;
        for change in changes {
            match change {
                Change::Upsert { resource, .. } => {
                    if let Some((index, existing)) =
                        aggregate.find(resource.kind(), resource.name())
                    {
                        if !existing.matches(resource) && policy == DuplicatePolicy::Reject {
                            return Err(CloudError::DuplicateName {
                                aggregate: id.to_string(),
                                name: resource.name().to_string(),
                            });
                        }
                        tracing::debug!(
                            "Replacing {} '{}' at index {}",
                            resource.kind(),
                            resource.name(),
                            index
                        );
                    }
                    let placement = aggregate.upsert(resource.clone());
                    tracing::debug!("Placed '{}': {:?}", resource.name(), placement);
                    dirty = true;
                }
                Change::Remove { kind, name, .. } => match aggregate.remove(*kind, name) {
                    Some((index, _)) => {
                        tracing::debug!("Removing {} '{}' at index {}", kind, name, index);
                        dirty = true;
                    }
                    None => {
                        tracing::debug!("{} '{}' already absent", kind, name);
                    }
                },
            }
        }

        if !dirty {
            return Ok(());
        }

        let handle = self.store.submit(&aggregate).await?;
        tracing::debug!("Submitted {} (token {:?})", id, handle.token);

        let deadline = Instant::now() + self.config.operation_timeout();
        self.store
            .poll_until_done(handle, deadline)
            .await
            .map_err(|e| match e {
                CloudError::Timeout(_) => e,
                other => CloudError::OperationFailed {
                    aggregate: id.to_string(),
                    source: Box::new(other),
                },
            })?;
        tracing::info!("Committed {} change(s) to {}", changes.len(), id);

        self.await_convergence(id, changes).await
    }

    /// Re-read until every change is visible, tolerating stale reads.
    async fn await_convergence(&self, id: &ResourceIdentifier, changes: &[&Change]) -> Result<()> {
        let mut expectations: Vec<Expectation<'_>> = Vec::new();
        for change in changes {
            let (kind, name) = change.target();
            let value = match change {
                Change::Upsert { resource, .. } => Some(resource),
                Change::Remove { .. } => None,
            };
            expectations.retain(|e| e.kind != kind || !locator::names_equal(e.name, name));
            expectations.push(Expectation { kind, name, value });
        }
        if !self.config.verify_removal {
            expectations.retain(|e| e.value.is_some());
        }
        let Some(first) = expectations.first() else {
            return Ok(());
        };

        let backoff = &self.config.convergence;
        let started = Instant::now();
        let deadline = started + backoff.timeout();
        let mut attempt = 0;

        loop {
            // The write has committed; a failed re-read only means it is not confirmed yet.
            let (pending, reason) = match self.store.fetch(id).await {
                Ok(aggregate) => match expectations.iter().find(|e| !e.is_met(&aggregate)) {
                    Some(pending) => (pending, "not yet visible".to_string()),
                    None => {
                        if attempt > 0 {
                            tracing::debug!("{} converged after {} re-read(s)", id, attempt);
                        }
                        return Ok(());
                    }
                },
                Err(err) => (first, format!("re-read failed: {}", err)),
            };

            attempt += 1;
            let now = Instant::now();
            if attempt >= backoff.max_attempts.max(1) || now >= deadline {
                return Err(CloudError::ConsistencyTimeout {
                    aggregate: id.to_string(),
                    name: pending.name.to_string(),
                    waited: now - started,
                    reason,
                });
            }

            let delay = backoff
                .delay_for_attempt(attempt - 1)
                .min(deadline - now);
            tracing::warn!(
                "{} '{}' in {} unconfirmed ({}), retrying in {:?} (attempt {})",
                pending.kind,
                pending.name,
                id,
                reason,
                delay,
                attempt
            );
            tokio::time::sleep(delay).await;
        }
    }
}
