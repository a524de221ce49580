//! In-memory aggregate store
//!
//! Behaves like a remote store with long-running writes: `submit` only queues
//! the new aggregate, which becomes current when `poll_until_done` finishes.
//! Faults can be injected to exercise the engine's error paths:
//! stale reads after a commit, submit conflicts and failed operations.

use crate::error::{CloudError, Result};
use crate::id::ResourceIdentifier;
use crate::model::AggregateResource;
use crate::store::{AggregateStore, OperationHandle};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    committed: AggregateResource,
    /// Snapshot served while stale reads remain after a commit
    previous: Option<AggregateResource>,
    stale_remaining: u32,
    version: u64,
    in_flight: usize,
}

#[derive(Debug)]
struct PendingOperation {
    key: String,
    aggregate: AggregateResource,
}

#[derive(Debug, Default)]
struct MemoryState {
    aggregates: HashMap<String, Entry>,
    operations: HashMap<String, PendingOperation>,
    next_operation: u64,
    fetches: usize,
    submits: usize,
    max_in_flight: usize,
    conflicts: u32,
    failures: VecDeque<String>,
}

impl MemoryState {
    /// Drop a pending operation without committing it
    fn abandon(&mut self, token: &str) {
        let Some(pending) = self.operations.remove(token) else {
            return;
        };
        if let Some(entry) = self.aggregates.get_mut(&pending.key) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}

/// Abandons the operation unless the poll settled it, including when the
/// polling future is dropped.
struct PendingGuard<'a> {
    store: &'a InMemoryStore,
    token: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.store.state().abandon(self.token);
    }
}

/// [`AggregateStore`] kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    latency: Duration,
    stale_reads: u32,
    check_etag: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time every operation takes between submit and completion
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of reads after each commit that still return the previous state
    pub fn with_stale_reads(mut self, count: u32) -> Self {
        self.stale_reads = count;
        self
    }

    /// Reject submits whose etag does not match the current version
    pub fn with_etag_checks(mut self, enabled: bool) -> Self {
        self.check_etag = enabled;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(id: &ResourceIdentifier) -> String {
        id.to_string().to_lowercase()
    }

    /// Create or overwrite an aggregate directly, bypassing operations
    pub fn insert(&self, aggregate: AggregateResource) {
        let mut state = self.state();
        let key = Self::key(&aggregate.id);
        let version = state.aggregates.get(&key).map_or(1, |e| e.version + 1);
        let committed = aggregate.with_etag(format!("v{}", version));
        state.aggregates.insert(
            key,
            Entry {
                committed,
                previous: None,
                stale_remaining: 0,
                version,
                in_flight: 0,
            },
        );
    }

    /// Current committed state, without counting as a fetch
    pub fn get(&self, id: &ResourceIdentifier) -> Option<AggregateResource> {
        self.state()
            .aggregates
            .get(&Self::key(id))
            .map(|e| e.committed.clone())
    }

    /// Make the next `count` submits fail with [`CloudError::Conflict`]
    pub fn inject_conflicts(&self, count: u32) {
        self.state().conflicts += count;
    }

    /// Make the next completed operation fail with `message`
    pub fn inject_operation_failure(&self, message: impl Into<String>) {
        self.state().failures.push_back(message.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    pub fn submit_count(&self) -> usize {
        self.state().submits
    }

    /// Highest number of operations ever in flight at once for one aggregate
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, id: &ResourceIdentifier) -> Result<AggregateResource> {
        let mut state = self.state();
        state.fetches += 1;
        let entry = state
            .aggregates
            .get_mut(&Self::key(id))
            .ok_or_else(|| CloudError::ResourceNotFound(id.to_string()))?;

        if entry.stale_remaining > 0 {
            entry.stale_remaining -= 1;
            if let Some(previous) = &entry.previous {
                return Ok(previous.clone());
            }
        }
        Ok(entry.committed.clone())
    }

    async fn submit(&self, aggregate: &AggregateResource) -> Result<OperationHandle> {
        let mut state = self.state();
        state.submits += 1;

        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(CloudError::Conflict(aggregate.id.to_string()));
        }

        let key = Self::key(&aggregate.id);
        let check_etag = self.check_etag;
        let entry = state
            .aggregates
            .get_mut(&key)
            .ok_or_else(|| CloudError::ResourceNotFound(aggregate.id.to_string()))?;
        if check_etag && aggregate.etag != entry.committed.etag {
            return Err(CloudError::Conflict(aggregate.id.to_string()));
        }
        entry.in_flight += 1;
        let in_flight = entry.in_flight;
        state.max_in_flight = state.max_in_flight.max(in_flight);

        state.next_operation += 1;
        let token = format!("op-{}", state.next_operation);
        state.operations.insert(
            token.clone(),
            PendingOperation {
                key,
                aggregate: aggregate.clone(),
            },
        );
        Ok(OperationHandle::pending(aggregate.id.clone(), token))
    }

    async fn poll_until_done(&self, handle: OperationHandle, deadline: Instant) -> Result<()> {
        let Some(token) = handle.token.as_deref() else {
            return Ok(());
        };
        let _pending = PendingGuard { store: self, token };

        let finish_at = Instant::now() + self.latency;
        if finish_at > deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(CloudError::Timeout(format!(
                "operation {} on {} still running after {:?}",
                token,
                handle.aggregate,
                handle.elapsed()
            )));
        }
        tokio::time::sleep_until(finish_at).await;

        let mut state = self.state();
        let pending = state
            .operations
            .remove(token)
            .ok_or_else(|| CloudError::ApiError(format!("unknown operation {}", token)))?;
        let failure = state.failures.pop_front();
        let stale_reads = self.stale_reads;
        let entry = state
            .aggregates
            .get_mut(&pending.key)
            .ok_or_else(|| CloudError::ResourceNotFound(handle.aggregate.to_string()))?;
        entry.in_flight = entry.in_flight.saturating_sub(1);

        if let Some(message) = failure {
            return Err(CloudError::ApiError(message));
        }

        entry.version += 1;
        let committed = pending
            .aggregate
            .with_etag(format!("v{}", entry.version));
        entry.previous = Some(std::mem::replace(&mut entry.committed, committed));
        entry.stale_remaining = stale_reads;
        Ok(())
    }
}
