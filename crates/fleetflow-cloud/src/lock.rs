//! Named advisory locks
//!
//! Each aggregate is guarded by one async mutex, looked up by a [`LockKey`].
//! The registry mutex is held only while looking up or creating the per-key
//! lock, never across the caller's critical section. Entries live for the
//! lifetime of the registry so that a releaser can never race a new acquirer
//! over removing and recreating the same key.

use crate::error::{CloudError, Result};
use crate::id::ResourceIdentifier;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Mutual-exclusion domain: `{resource_kind}.{aggregate_name}`, lower-cased
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(resource_kind: &str, aggregate_name: &str) -> Self {
        Self(format!("{}.{}", resource_kind, aggregate_name).to_lowercase())
    }

    /// Key guarding every sub-resource stored inside `id`
    pub fn for_aggregate(id: &ResourceIdentifier) -> Self {
        Self::new(id.resource_type(), id.name())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockKey {
    fn from(value: &str) -> Self {
        Self(value.to_lowercase())
    }
}

impl From<String> for LockKey {
    fn from(value: String) -> Self {
        Self(value.to_lowercase())
    }
}

/// Process-local registry of named locks
///
/// Construct one per process (or per test) and share it with every
/// [`crate::Reconciler`] through an `Arc`.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Block until the lock for `key` is held.
    pub async fn acquire(&self, key: &LockKey) -> LockGuard {
        let guard = self.entry(key).lock_owned().await;
        tracing::debug!("Acquired lock {}", key);
        LockGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Like [`LockRegistry::acquire`], but give up after `timeout`.
    pub async fn acquire_timeout(&self, key: &LockKey, timeout: Duration) -> Result<LockGuard> {
        match tokio::time::timeout(timeout, self.acquire(key)).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(CloudError::LockTimeout {
                key: key.to_string(),
                waited: timeout,
            }),
        }
    }

    /// Acquire several locks at once.
    ///
    /// Keys are deduplicated and taken in lexicographic order, so two callers
    /// needing overlapping key sets cannot deadlock on each other.
    pub async fn acquire_all(&self, keys: &[LockKey]) -> MultiLockGuard {
        let mut ordered: Vec<&LockKey> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.acquire(key).await);
        }
        MultiLockGuard { guards }
    }

    /// [`LockRegistry::acquire_all`] bounded by a single overall `timeout`.
    ///
    /// Locks taken before the deadline are released again on failure.
    pub async fn acquire_all_timeout(
        &self,
        keys: &[LockKey],
        timeout: Duration,
    ) -> Result<MultiLockGuard> {
        tokio::time::timeout(timeout, self.acquire_all(keys))
            .await
            .map_err(|_| CloudError::LockTimeout {
                key: keys
                    .iter()
                    .map(LockKey::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
                waited: timeout,
            })
    }

    /// Number of keys ever locked through this registry
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard for one named lock
///
/// Dropping the guard releases the lock, which also covers early returns,
/// task cancellation and panics.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    key: LockKey,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Release the lock
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::debug!("Released lock {}", self.key);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// RAII guard for a batch of locks, released in reverse acquisition order
#[must_use = "the locks are released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct MultiLockGuard {
    guards: Vec<LockGuard>,
}

impl MultiLockGuard {
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.guards.iter().map(LockGuard::key)
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lock_key_format() {
        let id = ResourceIdentifier::parse(
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/LB1",
        )
        .unwrap();
        assert_eq!(LockKey::for_aggregate(&id).as_str(), "loadbalancers.lb1");
        assert_eq!(LockKey::new("azurerm_lb", "Web"), LockKey::from("azurerm_lb.web"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_exclusive() {
        let registry = Arc::new(LockRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire(&LockKey::from("lb.one")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let registry = LockRegistry::new();
        let _a = registry.acquire(&LockKey::from("lb.a")).await;
        let b = registry
            .acquire_timeout(&LockKey::from("lb.b"), Duration::from_millis(50))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_timeout_expires() {
        let registry = LockRegistry::new();
        let key = LockKey::from("lb.a");
        let _held = registry.acquire(&key).await;

        let err = registry
            .acquire_timeout(&key, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let registry = LockRegistry::new();
        let key = LockKey::from("lb.a");
        registry.acquire(&key).await.release();
        let again = registry
            .acquire_timeout(&key, Duration::from_millis(20))
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_all_sorts_and_dedups() {
        let registry = LockRegistry::new();
        let keys = vec![
            LockKey::from("lb.b"),
            LockKey::from("lb.a"),
            LockKey::from("lb.b"),
        ];
        let guard = registry.acquire_all(&keys).await;
        let held: Vec<&str> = guard.keys().map(LockKey::as_str).collect();
        assert_eq!(held, vec!["lb.a", "lb.b"]);

        let blocked = registry
            .acquire_timeout(&LockKey::from("lb.a"), Duration::from_millis(20))
            .await;
        assert!(blocked.is_err());

        guard.release();
        assert!(
            registry
                .acquire_timeout(&LockKey::from("lb.a"), Duration::from_millis(20))
                .await
                .is_ok()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acquire_all_opposite_orders_do_not_deadlock() {
        let registry = Arc::new(LockRegistry::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let keys = if i % 2 == 0 {
                    vec![LockKey::from("lb.pool"), LockKey::from("lb.probe")]
                } else {
                    vec![LockKey::from("lb.probe"), LockKey::from("lb.pool")]
                };
                let _guard = registry.acquire_all(&keys).await;
                tokio::task::yield_now().await;
            }));
        }

        let all = async {
            for handle in handles {
                handle.await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), all)
            .await
            .expect("acquire_all deadlocked");
    }

    #[tokio::test]
    async fn test_aborted_holder_releases_lock() {
        let registry = Arc::new(LockRegistry::new());
        let key = LockKey::from("lb.a");

        let holder = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire(&key).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        holder.abort();
        let _ = holder.await;

        assert!(
            registry
                .acquire_timeout(&key, Duration::from_millis(100))
                .await
                .is_ok()
        );
    }
}
