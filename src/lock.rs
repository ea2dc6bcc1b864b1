//! Provides distributed mutual exclusion for cache rebuilds.
//!
//! Across a deployment, the only thing preventing several nodes from rebuilding the same
//! cache key at once is a lease based lock service. This module defines the contract
//! towards such a service ([LockProvider](LockProvider)), a complete in-process
//! implementation for tests and single node embeddings
//! ([LocalLockProvider](LocalLockProvider)) and the thin adapter the cache orchestrator
//! actually talks to ([LockCoordinator](LockCoordinator)).
//!
//! Locks are acquired by key string - no provider specific lock objects leak into the
//! cache logic. A successful acquisition yields a [LockToken](LockToken) which witnesses
//! ownership: release and ownership queries take the token, so releasing a lock held by
//! somebody else is impossible by construction. Every lease expires on its own, which
//! fences the system against a crashed holder deadlocking a key forever.
use crate::clock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Witnesses the ownership of an acquired lock.
///
/// The token is handed out by [LockProvider::try_acquire](LockProvider::try_acquire) and
/// must be presented when releasing the lock or querying ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockToken(u64);

impl LockToken {
    /// Creates a token from the given raw value.
    ///
    /// This is only needed by [LockProvider](LockProvider) implementations.
    pub fn new(value: u64) -> Self {
        LockToken(value)
    }

    /// Returns the raw token value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Describes the contract towards the external lock service.
///
/// Any service offering lease based mutual exclusion with ownership queries satisfies
/// this contract.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Attempts to acquire the lock for the given key.
    ///
    /// Waits up to **wait** for the lock to become free. On success, the lock is held for
    /// at most **lease** - after that it auto-releases, even if the holder crashed.
    /// Returns **None** if the lock could not be obtained within the wait bound.
    async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> anyhow::Result<Option<LockToken>>;

    /// Releases the lock for the given key.
    ///
    /// This is a no-op unless the given token is the current owner.
    async fn release(&self, key: &str, token: LockToken) -> anyhow::Result<()>;

    /// Determines if the lock for the given key is currently held by anyone.
    async fn is_locked(&self, key: &str) -> anyhow::Result<bool>;

    /// Determines if the lock for the given key is held by the owner of the given token.
    async fn is_held(&self, key: &str, token: LockToken) -> anyhow::Result<bool>;
}

/// The interval in which [LocalLockProvider](LocalLockProvider) re-checks a contended
/// lock while waiting for it.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tracks the current holder of a local lock.
struct Holder {
    token: LockToken,
    expires_at: u64,
}

impl Holder {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// Provides an in-process [LockProvider](LockProvider).
///
/// This guards rebuilds within a single process exactly like a remote lock service would
/// across a deployment - including lease expiry. It is used by tests and single node
/// embeddings; a distributed deployment must supply a provider backed by a shared
/// service, as no in-process lock can exclude other machines.
#[derive(Default)]
pub struct LocalLockProvider {
    locks: Mutex<HashMap<String, Holder>>,
    next_token: AtomicU64,
}

impl LocalLockProvider {
    /// Creates a new provider without any held locks.
    pub fn new() -> Self {
        LocalLockProvider {
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Performs a single acquisition attempt.
    fn attempt(&self, key: &str, lease: Duration) -> Option<LockToken> {
        let mut locks = self.locks.lock().unwrap();
        let now = clock::unix_millis();

        match locks.get(key) {
            Some(holder) if holder.is_live(now) => None,
            _ => {
                let token = LockToken(self.next_token.fetch_add(1, Ordering::Relaxed));
                let _ = locks.insert(
                    key.to_owned(),
                    Holder {
                        token,
                        expires_at: now + lease.as_millis() as u64,
                    },
                );
                Some(token)
            }
        }
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> anyhow::Result<Option<LockToken>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(token) = self.attempt(key, lease) {
                return Ok(Some(token));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, key: &str, token: LockToken) -> anyhow::Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).map(|holder| holder.token) == Some(token) {
            let _ = locks.remove(key);
        }
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> anyhow::Result<bool> {
        let now = clock::unix_millis();
        Ok(self
            .locks
            .lock()
            .unwrap()
            .get(key)
            .map(|holder| holder.is_live(now))
            .unwrap_or(false))
    }

    async fn is_held(&self, key: &str, token: LockToken) -> anyhow::Result<bool> {
        let now = clock::unix_millis();
        Ok(self
            .locks
            .lock()
            .unwrap()
            .get(key)
            .map(|holder| holder.is_live(now) && holder.token == token)
            .unwrap_or(false))
    }
}

/// Represents a successfully acquired lock.
///
/// The guard keeps the key and the ownership token together so that it can only ever be
/// released as a whole.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: LockToken,
}

impl LockGuard {
    /// Returns the (namespaced) key this guard locks.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Adapts the external lock service to the needs of the cache orchestrator.
///
/// The coordinator namespaces all lock keys so that lock entries can never collide with
/// cached values living in the same store.
#[derive(Clone)]
pub struct LockCoordinator {
    provider: Arc<dyn LockProvider>,
}

impl LockCoordinator {
    /// Creates a coordinator delegating to the given provider.
    pub fn new(provider: Arc<dyn LockProvider>) -> Self {
        LockCoordinator { provider }
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{}", key)
    }

    /// Attempts to acquire the rebuild lock for the given cache key.
    ///
    /// See [LockProvider::try_acquire](LockProvider::try_acquire) for the wait and lease
    /// semantics.
    pub async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> anyhow::Result<Option<LockGuard>> {
        let lock_key = Self::lock_key(key);
        Ok(self
            .provider
            .try_acquire(&lock_key, wait, lease)
            .await?
            .map(|token| LockGuard {
                key: lock_key,
                token,
            }))
    }

    /// Releases the given lock.
    pub async fn release(&self, guard: LockGuard) -> anyhow::Result<()> {
        self.provider.release(&guard.key, guard.token).await
    }

    /// Determines if the rebuild lock for the given cache key is held by anyone.
    pub async fn is_locked(&self, key: &str) -> anyhow::Result<bool> {
        self.provider.is_locked(&Self::lock_key(key)).await
    }

    /// Determines if the given guard still owns its lock (its lease might have expired).
    pub async fn is_held(&self, guard: &LockGuard) -> anyhow::Result<bool> {
        self.provider.is_held(&guard.key, guard.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock_instant::global::MockClock;

    #[test]
    fn locks_are_mutually_exclusive() {
        crate::testing::test_async(async {
            MockClock::set_time(Duration::ZERO);
            let provider = LocalLockProvider::new();

            let token = provider
                .try_acquire("key", Duration::ZERO, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();

            // A second acquisition with zero wait fails immediately...
            assert_eq!(
                provider
                    .try_acquire("key", Duration::ZERO, Duration::from_secs(10))
                    .await
                    .unwrap(),
                None
            );

            // ...until the lock is released.
            provider.release("key", token).await.unwrap();
            assert!(provider
                .try_acquire("key", Duration::ZERO, Duration::from_secs(10))
                .await
                .unwrap()
                .is_some());
        });
    }

    #[test]
    fn release_is_a_no_op_for_non_owners() {
        crate::testing::test_async(async {
            MockClock::set_time(Duration::ZERO);
            let provider = LocalLockProvider::new();

            let token = provider
                .try_acquire("key", Duration::ZERO, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();

            // A token which never owned the lock cannot release it...
            provider.release("key", LockToken::new(4711)).await.unwrap();
            assert_eq!(provider.is_locked("key").await.unwrap(), true);
            assert_eq!(provider.is_held("key", token).await.unwrap(), true);

            // ...but the owner can.
            provider.release("key", token).await.unwrap();
            assert_eq!(provider.is_locked("key").await.unwrap(), false);
        });
    }

    #[test]
    fn leases_expire_on_their_own() {
        crate::testing::test_async(async {
            MockClock::set_time(Duration::ZERO);
            let provider = LocalLockProvider::new();

            let token = provider
                .try_acquire("key", Duration::ZERO, Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(provider.is_held("key", token).await.unwrap(), true);

            // Once the lease elapsed, the lock is up for grabs even though it was never
            // released - this fences against crashed holders.
            MockClock::advance(Duration::from_secs(6));
            assert_eq!(provider.is_locked("key").await.unwrap(), false);
            assert!(provider
                .try_acquire("key", Duration::ZERO, Duration::from_secs(5))
                .await
                .unwrap()
                .is_some());
        });
    }

    #[test]
    fn coordinator_namespaces_its_keys() {
        crate::testing::test_async(async {
            MockClock::set_time(Duration::ZERO);
            let provider = Arc::new(LocalLockProvider::new());
            let coordinator = LockCoordinator::new(provider.clone());

            let guard = coordinator
                .try_acquire("product:1", Duration::ZERO, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();

            assert_eq!(guard.key(), "lock:product:1");
            assert_eq!(coordinator.is_locked("product:1").await.unwrap(), true);
            assert_eq!(coordinator.is_held(&guard).await.unwrap(), true);

            // The raw cache key is not locked - only the namespaced lock entry is.
            assert_eq!(provider.is_locked("product:1").await.unwrap(), false);

            coordinator.release(guard).await.unwrap();
            assert_eq!(coordinator.is_locked("product:1").await.unwrap(), false);
        });
    }
}
