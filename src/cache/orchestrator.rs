//! Implements the read-through query strategies.
//!
//! All queries share one shape: build the key, look into the store, and on a miss (or on
//! staleness) run the strategy specific rebuild protocol around the caller supplied
//! fallback. See the [module docs](crate::cache) for picking a strategy.
use crate::average::Average;
use crate::cache::CacheEntry;
use crate::clock;
use crate::config::{CacheSettings, Config};
use crate::keys;
use crate::lock::{LockCoordinator, LockProvider};
use crate::platform::Platform;
use crate::pool::CachePool;
use crate::store::Store;
use crate::values;
use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Collects the counters reported by [CacheOrchestrator::stats](CacheOrchestrator::stats).
#[derive(Default)]
struct Metrics {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    rebuilds: AtomicU64,
    fallback_time: Average,
}

/// Executes read-through queries against the backing store.
///
/// The orchestrator owns no data itself - it coordinates the store, the distributed lock
/// and the background pool so that for any given key at most one fallback evaluation
/// reaches the source of truth while a rebuild is protected by the lock.
///
/// # Example
///
/// ```
/// # use palisade::cache::CacheOrchestrator;
/// # use palisade::config::CacheSettings;
/// # use palisade::lock::LocalLockProvider;
/// # use palisade::pool::CachePool;
/// # use palisade::store::MemoryStore;
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// let cache = CacheOrchestrator::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(LocalLockProvider::new()),
///     Arc::new(CachePool::new(2, 64)),
///     CacheSettings::default(),
/// );
///
/// // The first query misses and computes the value via the fallback...
/// let value = cache
///     .query_with_pass_through("product:", &42, Duration::from_secs(60), || async {
///         Ok(Some("Telescope".to_owned()))
///     })
///     .await
///     .unwrap();
/// assert_eq!(value.content, "Telescope");
///
/// // ...subsequent queries are answered from the cache without touching the fallback.
/// let value = cache
///     .query_with_pass_through("product:", &42, Duration::from_secs(60), || async {
///         Ok(None::<String>)
///     })
///     .await
///     .unwrap();
/// assert_eq!(value.content, "Telescope");
/// # }
/// ```
pub struct CacheOrchestrator {
    store: Arc<dyn Store>,
    locks: LockCoordinator,
    pool: Arc<CachePool>,
    tuning: ArcSwap<CacheSettings>,
    metrics: Arc<Metrics>,
}

impl CacheOrchestrator {
    /// Creates an orchestrator over the given collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        lock_provider: Arc<dyn LockProvider>,
        pool: Arc<CachePool>,
        settings: CacheSettings,
    ) -> Self {
        CacheOrchestrator {
            store,
            locks: LockCoordinator::new(lock_provider),
            pool,
            tuning: ArcSwap::new(Arc::new(settings)),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Applies new timing settings.
    ///
    /// This is invoked by the config change listener installed by [install](install) so
    /// that timing changes take effect without a restart.
    pub fn update_settings(&self, settings: CacheSettings) {
        self.tuning.store(Arc::new(settings));
    }

    // ---------------------------------------------------------------------------------
    // Pass-through: defends against cache penetration.
    // ---------------------------------------------------------------------------------

    /// Queries a value, computing it via the fallback on a miss.
    ///
    /// If the fallback reports the value as non-existent, a negative marker is stored
    /// under a short TTL so that repeated lookups for a missing key cannot hammer the
    /// source of truth. The returned entry has `exists == false` in that case.
    ///
    /// Fallback errors propagate to the caller; nothing is cached for them.
    pub async fn query_with_pass_through<I, R, F, Fut>(
        &self,
        key_prefix: &str,
        id: &I,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<R>>
    where
        I: Serialize + ?Sized,
        R: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<R>>>,
    {
        let key = keys::build_key(key_prefix, Some(id))?;
        self.pass_through(key, ttl, fallback).await
    }

    /// Like [query_with_pass_through](Self::query_with_pass_through) for queries without
    /// a per-entity identifier - the prefix itself is the key.
    pub async fn query_with_pass_through_without_args<R, F, Fut>(
        &self,
        key_prefix: &str,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<R>>
    where
        R: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<R>>>,
    {
        let key = keys::build_key(key_prefix, None::<&str>)?;
        self.pass_through(key, ttl, fallback).await
    }

    /// The list form of [query_with_pass_through](Self::query_with_pass_through).
    ///
    /// An empty list reported by the fallback is treated as a negative result.
    pub async fn query_with_pass_through_list<I, R, F, Fut>(
        &self,
        key_prefix: &str,
        id: &I,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<Vec<R>>>
    where
        I: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let key = keys::build_key(key_prefix, Some(id))?;
        self.pass_through(key, ttl, || async move { Ok(non_empty(fallback().await?)) })
            .await
    }

    /// The list form of
    /// [query_with_pass_through_without_args](Self::query_with_pass_through_without_args).
    pub async fn query_with_pass_through_list_without_args<R, F, Fut>(
        &self,
        key_prefix: &str,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<Vec<R>>>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let key = keys::build_key(key_prefix, None::<&str>)?;
        self.pass_through(key, ttl, || async move { Ok(non_empty(fallback().await?)) })
            .await
    }

    /// Implements the pass-through protocol for an already built key.
    async fn pass_through<T, F, Fut>(
        &self,
        key: String,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<T>>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Some(raw) = self.store.get(&key).await? {
            if raw.is_empty() {
                // The negative marker: we already know this key doesn't exist, so we
                // answer without re-consulting the fallback.
                let _ = self.metrics.negative_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry::absent());
            }
            match decode_content::<T>(&raw) {
                Ok(content) => {
                    let _ = self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheEntry::hit(content));
                }
                Err(error) => {
                    log::warn!("Discarding malformed cache value for {}: {:#}", key, error)
                }
            }
        }

        let _ = self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        match self.observe_fallback(fallback).await? {
            Some(content) => {
                let encoded = values::encode(&content)?;
                self.store
                    .set(&key, Bytes::from(encoded), Some(ttl))
                    .await?;
                Ok(CacheEntry::hit(content))
            }
            None => {
                self.store
                    .set(&key, Bytes::new(), Some(self.empty_ttl(ttl)))
                    .await?;
                Ok(CacheEntry::absent())
            }
        }
    }

    // ---------------------------------------------------------------------------------
    // Logical expiry: defends against cache avalanches without ever blocking a reader.
    // ---------------------------------------------------------------------------------

    /// Queries a value judged by its logical expiry timestamp.
    ///
    /// A fresh entry is returned immediately. A stale entry is *also* returned
    /// immediately - but the first reader to observe the staleness schedules a background
    /// rebuild, guarded by the distributed lock so that at most one rebuild per key is in
    /// flight. Readers therefore never wait, at the price of serving data which may be up
    /// to one rebuild-duration old.
    ///
    /// A key which was never written at all yields an absent entry: this strategy relies
    /// on pre-warming via [put_with_logical_expire](Self::put_with_logical_expire) and
    /// deliberately does not populate on a total miss, as that would put the fallback
    /// back onto the read path.
    pub async fn query_with_logical_expire<I, R, F, Fut>(
        &self,
        key_prefix: &str,
        id: &I,
        duration: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<R>>
    where
        I: Serialize + ?Sized,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send,
    {
        let key = keys::build_key(key_prefix, Some(id))?;
        self.logical_expire(key, duration, fallback).await
    }

    /// Like [query_with_logical_expire](Self::query_with_logical_expire) for queries
    /// without a per-entity identifier.
    pub async fn query_with_logical_expire_without_args<R, F, Fut>(
        &self,
        key_prefix: &str,
        duration: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<R>>
    where
        R: Serialize + DeserializeOwned + Default + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send,
    {
        let key = keys::build_key(key_prefix, None::<&str>)?;
        self.logical_expire(key, duration, fallback).await
    }

    /// The list form of [query_with_logical_expire](Self::query_with_logical_expire).
    pub async fn query_with_logical_expire_list<I, R, F, Fut>(
        &self,
        key_prefix: &str,
        id: &I,
        duration: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<Vec<R>>>
    where
        I: Serialize + ?Sized,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send,
    {
        let key = keys::build_key(key_prefix, Some(id))?;
        self.logical_expire(key, duration, || async move {
            Ok(non_empty(fallback().await?))
        })
        .await
    }

    /// The list form of
    /// [query_with_logical_expire_without_args](Self::query_with_logical_expire_without_args).
    pub async fn query_with_logical_expire_list_without_args<R, F, Fut>(
        &self,
        key_prefix: &str,
        duration: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<Vec<R>>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send,
    {
        let key = keys::build_key(key_prefix, None::<&str>)?;
        self.logical_expire(key, duration, || async move {
            Ok(non_empty(fallback().await?))
        })
        .await
    }

    /// Implements the logical-expiry protocol for an already built key.
    async fn logical_expire<T, F, Fut>(
        &self,
        key: String,
        duration: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<T>>
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        let raw = match self.store.get(&key).await? {
            Some(raw) => raw,
            None => {
                let _ = self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry::absent());
            }
        };

        let entry: CacheEntry<T> = match decode_entry(&raw) {
            Ok(entry) => entry,
            Err(error) => {
                log::warn!("Discarding malformed cache entry for {}: {:#}", key, error);
                let _ = self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry::absent());
            }
        };

        if entry.is_fresh(clock::unix_millis()) {
            let _ = self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        // The entry is stale: serve it as is, and try to become the one reader which
        // schedules the rebuild. Zero wait - if the lock is taken, a rebuild is already
        // in flight and there is nothing left to do for us.
        let _ = self.metrics.stale_served.fetch_add(1, Ordering::Relaxed);

        let lease = self.tuning.load().lock_lease;
        if let Some(guard) = self.locks.try_acquire(&key, Duration::ZERO, lease).await? {
            let _ = self.metrics.rebuilds.fetch_add(1, Ordering::Relaxed);

            let store = self.store.clone();
            let locks = self.locks.clone();
            let metrics = self.metrics.clone();
            let started_version = entry.version;
            let task_key = key.clone();

            self.pool
                .submit(Box::pin(async move {
                    if let Err(error) = rebuild_entry(
                        &store,
                        &metrics,
                        &task_key,
                        started_version,
                        duration,
                        fallback,
                    )
                    .await
                    {
                        log::error!(
                            "Background rebuild of {} failed - the stale value stays authoritative: {:#}",
                            task_key,
                            error
                        );
                    }

                    // Released on every exit path - success, fallback failure and encode
                    // failure alike.
                    if let Err(error) = locks.release(guard).await {
                        log::error!(
                            "Failed to release the rebuild lock of {}: {:#}",
                            task_key,
                            error
                        );
                    }
                }))
                .await;
        }

        Ok(entry)
    }

    /// Stores a value as a logical-expiry entry.
    ///
    /// This is the pre-warming counterpart of
    /// [query_with_logical_expire](Self::query_with_logical_expire). The entry is written
    /// without a physical TTL - it only ever leaves the store through an explicit
    /// [delete](Self::delete). The entry version is incremented so that rebuilds racing
    /// this write discard their results.
    pub async fn put_with_logical_expire<I, T>(
        &self,
        key_prefix: &str,
        id: Option<&I>,
        value: &T,
        duration: Duration,
    ) -> anyhow::Result<()>
    where
        I: Serialize + ?Sized,
        T: Serialize,
    {
        let key = keys::build_key(key_prefix, id)?;
        let version = probe_version(&self.store, &key).await?.unwrap_or(0) + 1;

        let entry = CacheEntry {
            exists: true,
            version: Some(version),
            retry_later: false,
            content: value,
            logical_expire_at: Some(clock::unix_millis() + duration.as_millis() as u64),
        };
        self.store
            .set(&key, Bytes::from(serde_json::to_string(&entry)?), None)
            .await
    }

    // ---------------------------------------------------------------------------------
    // Mutex: defends against cache breakdown of a single hot key.
    // ---------------------------------------------------------------------------------

    /// Queries a value, rebuilding it under the distributed lock on a miss.
    ///
    /// Whichever caller obtains the lock performs exactly one fallback evaluation; all
    /// others observe its written result. Callers which cannot obtain the lock within
    /// the configured attempts receive an entry with `retry_later == true` instead of
    /// blocking forever - all waits in here are bounded.
    pub async fn query_with_mutex<I, R, F, Fut>(
        &self,
        key_prefix: &str,
        id: &I,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<R>>
    where
        I: Serialize + ?Sized,
        R: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<R>>>,
    {
        let key = keys::build_key(key_prefix, Some(id))?;
        self.mutex(key, ttl, fallback).await
    }

    /// Like [query_with_mutex](Self::query_with_mutex) for queries without a per-entity
    /// identifier.
    pub async fn query_with_mutex_without_args<R, F, Fut>(
        &self,
        key_prefix: &str,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<R>>
    where
        R: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<R>>>,
    {
        let key = keys::build_key(key_prefix, None::<&str>)?;
        self.mutex(key, ttl, fallback).await
    }

    /// The list form of [query_with_mutex](Self::query_with_mutex).
    pub async fn query_with_mutex_list<I, R, F, Fut>(
        &self,
        key_prefix: &str,
        id: &I,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<Vec<R>>>
    where
        I: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let key = keys::build_key(key_prefix, Some(id))?;
        self.mutex(key, ttl, || async move { Ok(non_empty(fallback().await?)) })
            .await
    }

    /// The list form of
    /// [query_with_mutex_without_args](Self::query_with_mutex_without_args).
    pub async fn query_with_mutex_list_without_args<R, F, Fut>(
        &self,
        key_prefix: &str,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<Vec<R>>>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let key = keys::build_key(key_prefix, None::<&str>)?;
        self.mutex(key, ttl, || async move { Ok(non_empty(fallback().await?)) })
            .await
    }

    /// Implements the mutex protocol for an already built key.
    async fn mutex<T, F, Fut>(
        &self,
        key: String,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<T>>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let tuning = self.tuning.load_full();
        let mut attempts = 0;

        let guard = loop {
            if let Some(raw) = self.store.get(&key).await? {
                if raw.is_empty() {
                    let _ = self.metrics.negative_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheEntry::absent());
                }
                match decode_content::<T>(&raw) {
                    Ok(content) => {
                        let _ = self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(CacheEntry::hit(content));
                    }
                    Err(error) => {
                        log::warn!("Discarding malformed cache value for {}: {:#}", key, error)
                    }
                }
            }

            match self
                .locks
                .try_acquire(&key, tuning.lock_wait, tuning.lock_lease)
                .await?
            {
                Some(guard) => break guard,
                None => {
                    attempts += 1;
                    if attempts > tuning.retry_attempts {
                        log::warn!(
                            "Could not obtain the rebuild lock for {} after {} attempts - responding with a degraded result.",
                            key,
                            attempts
                        );
                        return Ok(CacheEntry::degraded());
                    }
                    tokio::time::sleep(tuning.retry_interval).await;
                }
            }
        };

        let _ = self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        // Whatever happens while holding the lock - it is released before we return.
        let result = self.load_and_store(&key, ttl, fallback).await;
        if let Err(error) = self.locks.release(guard).await {
            log::error!("Failed to release the rebuild lock of {}: {:#}", key, error);
        }

        result
    }

    /// Runs the guarded section of the mutex protocol: double-check, fallback, write.
    async fn load_and_store<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fallback: F,
    ) -> anyhow::Result<CacheEntry<T>>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        // Another holder may have populated the key while we awaited the lock...
        if let Some(raw) = self.store.get(key).await? {
            if raw.is_empty() {
                let _ = self.metrics.negative_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry::absent());
            }
            if let Ok(content) = decode_content::<T>(&raw) {
                let _ = self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry::hit(content));
            }
        }

        match self.observe_fallback(fallback).await? {
            Some(content) => {
                let encoded = values::encode(&content)?;
                self.store.set(key, Bytes::from(encoded), Some(ttl)).await?;
                Ok(CacheEntry::hit(content))
            }
            None => {
                self.store
                    .set(key, Bytes::new(), Some(self.empty_ttl(ttl)))
                    .await?;
                Ok(CacheEntry::absent())
            }
        }
    }

    // ---------------------------------------------------------------------------------
    // Direct write-side operations.
    // ---------------------------------------------------------------------------------

    /// Stores an encoded value under the given key.
    ///
    /// Without a TTL, the key lives until it is explicitly deleted.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let encoded = values::encode(value)?;
        self.store.set(key, Bytes::from(encoded), ttl).await
    }

    /// Deletes the value stored under the given key.
    pub async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.store.delete(key).await
    }

    /// Re-assigns the TTL of the given key.
    pub async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.store.expire(key, ttl).await
    }

    /// Deletes all keys matching the given pattern and reports how many were removed.
    pub async fn purge(&self, pattern: &str) -> anyhow::Result<usize> {
        let keys = self.store.scan(pattern).await?;
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }

        log::info!("Purged {} keys matching '{}'.", removed, pattern);
        Ok(removed)
    }

    /// Renders a small report of the collected metrics.
    pub fn stats(&self) -> String {
        let mut result = String::new();

        result += format!(
            "{:<30} {:>20}\n",
            "Cache Hits",
            self.metrics.hits.load(Ordering::Relaxed)
        )
        .as_str();
        result += format!(
            "{:<30} {:>20}\n",
            "Negative Hits",
            self.metrics.negative_hits.load(Ordering::Relaxed)
        )
        .as_str();
        result += format!(
            "{:<30} {:>20}\n",
            "Misses",
            self.metrics.misses.load(Ordering::Relaxed)
        )
        .as_str();
        result += format!(
            "{:<30} {:>20}\n",
            "Stale Served",
            self.metrics.stale_served.load(Ordering::Relaxed)
        )
        .as_str();
        result += format!(
            "{:<30} {:>20}\n",
            "Rebuilds",
            self.metrics.rebuilds.load(Ordering::Relaxed)
        )
        .as_str();
        result += format!(
            "{:<30} {:>20}\n",
            "Avg. Fallback",
            format!("{}", self.metrics.fallback_time)
        )
        .as_str();

        result
    }

    /// Runs the fallback while measuring its duration.
    async fn observe_fallback<T, F, Fut>(&self, fallback: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let start = std::time::Instant::now();
        let result = fallback().await;
        self.metrics.fallback_time.add(elapsed_micros(start));

        result.context("The fallback failed to produce a value")
    }

    /// Determines the TTL for negative markers.
    ///
    /// Unless configured explicitly, a tenth of the entry TTL is used, but at least a
    /// second and never more than the entry TTL itself.
    fn empty_ttl(&self, ttl: Duration) -> Duration {
        match self.tuning.load().empty_ttl {
            Some(empty_ttl) => empty_ttl,
            None => (ttl / 10).max(Duration::from_secs(1)).min(ttl),
        }
    }
}

/// Performs the actual background rebuild of a logical-expiry entry.
async fn rebuild_entry<T, F, Fut>(
    store: &Arc<dyn Store>,
    metrics: &Metrics,
    key: &str,
    started_version: Option<i64>,
    duration: Duration,
    fallback: F,
) -> anyhow::Result<()>
where
    T: Serialize + Default,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let start = std::time::Instant::now();
    let result = fallback().await;
    metrics.fallback_time.add(elapsed_micros(start));

    let content = result.context("The fallback failed during the background rebuild")?;

    // If a newer version has been written while the fallback ran, our result is based on
    // outdated state and must not overwrite it...
    let current_version = probe_version(store, key).await?;
    if current_version > started_version {
        log::info!(
            "Discarding the rebuild of {} - a newer version has been written concurrently.",
            key
        );
        return Ok(());
    }

    let entry = CacheEntry {
        exists: content.is_some(),
        version: Some(current_version.unwrap_or(0) + 1),
        retry_later: false,
        content: content.unwrap_or_default(),
        logical_expire_at: Some(clock::unix_millis() + duration.as_millis() as u64),
    };
    store
        .set(key, Bytes::from(serde_json::to_string(&entry)?), None)
        .await
}

/// Reads the version of the entry currently stored for the given key.
async fn probe_version(store: &Arc<dyn Store>, key: &str) -> anyhow::Result<Option<i64>> {
    #[derive(Deserialize)]
    struct VersionProbe {
        #[serde(default)]
        version: Option<i64>,
    }

    match store.get(key).await? {
        Some(raw) => Ok(serde_json::from_slice::<VersionProbe>(&raw)
            .ok()
            .and_then(|probe| probe.version)),
        None => Ok(None),
    }
}

/// Decodes a bare cached value.
fn decode_content<T: DeserializeOwned + Default>(raw: &Bytes) -> anyhow::Result<T> {
    let text = std::str::from_utf8(raw).context("The stored bytes are not valid UTF-8")?;
    values::decode(text)
}

/// Decodes a stored logical-expiry entry.
fn decode_entry<T: DeserializeOwned>(raw: &Bytes) -> anyhow::Result<CacheEntry<T>> {
    Ok(serde_json::from_slice(raw)?)
}

/// Maps an empty list onto a negative result.
fn non_empty<T>(list: Vec<T>) -> Option<Vec<T>> {
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

fn elapsed_micros(start: std::time::Instant) -> i32 {
    start.elapsed().as_micros().min(i32::MAX as u128) as i32
}

/// Creates an orchestrator from the system config and registers it in the platform.
///
/// The store and the lock provider are external collaborators and therefore have to be
/// supplied by the embedder. The background pool and the timing settings are taken from
/// the platform; a config change listener keeps the timings up to date without a restart.
pub fn install(
    platform: Arc<Platform>,
    store: Arc<dyn Store>,
    lock_provider: Arc<dyn LockProvider>,
) -> Arc<CacheOrchestrator> {
    let config = platform.require::<Config>();
    let pool = platform.require::<CachePool>();

    let orchestrator = Arc::new(CacheOrchestrator::new(
        store,
        lock_provider,
        pool,
        config.current().cache.clone(),
    ));
    platform.register::<CacheOrchestrator>(orchestrator.clone());

    let listener = orchestrator.clone();
    let listener_platform = platform.clone();
    let _ = tokio::spawn(async move {
        let mut changes = config.notifier();
        while listener_platform.is_running() {
            match changes.recv().await {
                Ok(_) => listener.update_settings(config.current().cache.clone()),
                Err(_) => return,
            }
        }
    });

    orchestrator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalLockProvider;
    use crate::store::MemoryStore;
    use futures::future::join_all;
    use mock_instant::global::MockClock;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        cache: CacheOrchestrator,
        pool: Arc<CachePool>,
        locks: Arc<LocalLockProvider>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        fixture_with(CacheSettings::default())
    }

    fn fixture_with(settings: CacheSettings) -> Fixture {
        MockClock::set_time(Duration::ZERO);
        let pool = Arc::new(CachePool::new(2, 64));
        let locks = Arc::new(LocalLockProvider::new());
        let cache = CacheOrchestrator::new(
            Arc::new(MemoryStore::new()),
            locks.clone(),
            pool.clone(),
            settings,
        );

        Fixture {
            cache,
            pool,
            locks,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    impl Fixture {
        /// A fallback which counts its invocations and yields the given value.
        fn counting_fallback(
            &self,
            value: Option<&'static str>,
        ) -> impl Fn() -> futures::future::Ready<anyhow::Result<Option<String>>> {
            let calls = self.calls.clone();
            move || {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(value.map(|value| value.to_owned())))
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn pass_through_caches_values() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let ttl = Duration::from_secs(60);

            let entry = fixture
                .cache
                .query_with_pass_through("product:", &1, ttl, fixture.counting_fallback(Some("Telescope")))
                .await
                .unwrap();
            assert_eq!(entry.exists, true);
            assert_eq!(entry.content, "Telescope");
            assert_eq!(fixture.call_count(), 1);

            // The second query is served from the cache...
            let entry = fixture
                .cache
                .query_with_pass_through("product:", &1, ttl, fixture.counting_fallback(Some("Telescope")))
                .await
                .unwrap();
            assert_eq!(entry.content, "Telescope");
            assert_eq!(fixture.call_count(), 1);

            // ...until the TTL elapsed.
            MockClock::advance(Duration::from_secs(61));
            let _ = fixture
                .cache
                .query_with_pass_through("product:", &1, ttl, fixture.counting_fallback(Some("Telescope")))
                .await
                .unwrap();
            assert_eq!(fixture.call_count(), 2);
        });
    }

    #[test]
    fn pass_through_defends_against_penetration() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let ttl = Duration::from_secs(100);

            // 8 concurrent callers for a key which doesn't exist anywhere...
            let queries = (0..8).map(|_| {
                fixture.cache.query_with_pass_through(
                    "missing:",
                    &1,
                    ttl,
                    fixture.counting_fallback(None),
                )
            });
            for entry in join_all(queries).await {
                let entry = entry.unwrap();
                assert_eq!(entry.exists, false);
                assert_eq!(entry.content, "");
            }

            // ...cause at most one fallback invocation within the marker TTL.
            assert_eq!(fixture.call_count(), 1);

            // Once the (derived ttl/10) marker expired, the fallback is consulted again.
            MockClock::advance(Duration::from_secs(11));
            let _ = fixture
                .cache
                .query_with_pass_through("missing:", &1, ttl, fixture.counting_fallback(None))
                .await
                .unwrap();
            assert_eq!(fixture.call_count(), 2);
        });
    }

    #[test]
    fn pass_through_propagates_fallback_failures() {
        crate::testing::test_async(async {
            let fixture = fixture();

            let result = fixture
                .cache
                .query_with_pass_through::<_, String, _, _>(
                    "product:",
                    &1,
                    Duration::from_secs(60),
                    || async { Err(anyhow::anyhow!("database down")) },
                )
                .await;
            assert_eq!(result.is_err(), true);

            // Nothing was cached for the failed computation - the next caller retries.
            let entry = fixture
                .cache
                .query_with_pass_through(
                    "product:",
                    &1,
                    Duration::from_secs(60),
                    fixture.counting_fallback(Some("recovered")),
                )
                .await
                .unwrap();
            assert_eq!(entry.content, "recovered");
            assert_eq!(fixture.call_count(), 1);
        });
    }

    #[test]
    fn pass_through_list_treats_empty_as_negative() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let calls = fixture.calls.clone();

            let entry = fixture
                .cache
                .query_with_pass_through_list_without_args("products", Duration::from_secs(60), {
                    let calls = calls.clone();
                    move || async move {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Vec::<String>::new())
                    }
                })
                .await
                .unwrap();
            assert_eq!(entry.exists, false);
            assert_eq!(entry.content, Vec::<String>::new());

            // The negative marker answers the next query without a fallback call.
            let entry = fixture
                .cache
                .query_with_pass_through_list_without_args("products", Duration::from_secs(60), {
                    let calls = calls.clone();
                    move || async move {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        Ok(vec!["late".to_owned()])
                    }
                })
                .await
                .unwrap();
            assert_eq!(entry.exists, false);
            assert_eq!(fixture.call_count(), 1);
        });
    }

    #[test]
    fn mutex_rebuilds_exactly_once_under_concurrency() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let calls = fixture.calls.clone();

            // 8 concurrent callers race a cold key. The fallback yields to enforce true
            // overlap between the contenders...
            let queries = (0..8).map(|_| {
                let calls = calls.clone();
                fixture
                    .cache
                    .query_with_mutex("hot:", &7, Duration::from_secs(60), move || async move {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(Some("value".to_owned()))
                    })
            });

            for entry in join_all(queries).await {
                let entry = entry.unwrap();
                assert_eq!(entry.retry_later, false);
                assert_eq!(entry.content, "value");
            }

            // Exactly one of them reached the source of truth.
            assert_eq!(fixture.call_count(), 1);
        });
    }

    #[test]
    fn mutex_degrades_when_the_lock_stays_unavailable() {
        crate::testing::test_async(async {
            let settings = CacheSettings {
                lock_wait: Duration::from_millis(5),
                retry_interval: Duration::from_millis(5),
                retry_attempts: 2,
                ..CacheSettings::default()
            };
            let fixture = fixture_with(settings);

            // Somebody else holds the rebuild lock for the whole test...
            let blocker = fixture
                .locks
                .try_acquire("lock:hot:7", Duration::ZERO, Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();

            let entry = fixture
                .cache
                .query_with_mutex::<_, String, _, _>(
                    "hot:",
                    &7,
                    Duration::from_secs(60),
                    fixture.counting_fallback(Some("never")),
                )
                .await
                .unwrap();

            // The caller receives a degraded result instead of blocking forever and the
            // fallback was never consulted.
            assert_eq!(entry.retry_later, true);
            assert_eq!(entry.exists, false);
            assert_eq!(fixture.call_count(), 0);

            fixture.locks.release("lock:hot:7", blocker).await.unwrap();
        });
    }

    #[test]
    fn mutex_caches_negative_results() {
        crate::testing::test_async(async {
            let fixture = fixture();

            let entry = fixture
                .cache
                .query_with_mutex::<_, String, _, _>(
                    "missing:",
                    &1,
                    Duration::from_secs(60),
                    fixture.counting_fallback(None),
                )
                .await
                .unwrap();
            assert_eq!(entry.exists, false);

            let entry = fixture
                .cache
                .query_with_mutex::<_, String, _, _>(
                    "missing:",
                    &1,
                    Duration::from_secs(60),
                    fixture.counting_fallback(None),
                )
                .await
                .unwrap();
            assert_eq!(entry.exists, false);
            assert_eq!(fixture.call_count(), 1);
        });
    }

    #[test]
    fn logical_expire_misses_without_pre_warming() {
        crate::testing::test_async(async {
            let fixture = fixture();

            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    Duration::from_secs(60),
                    fixture.counting_fallback(Some("never")),
                )
                .await
                .unwrap();

            // A total miss is not populated synchronously - reads stay non-blocking.
            assert_eq!(entry.exists, false);
            assert_eq!(fixture.call_count(), 0);
        });
    }

    #[test]
    fn logical_expire_serves_stale_and_rebuilds_once() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let duration = Duration::from_secs(60);

            fixture
                .cache
                .put_with_logical_expire("warm:", Some(&1), &"v1".to_owned(), duration)
                .await
                .unwrap();

            // While fresh, queries return the value without consulting the fallback...
            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    duration,
                    fixture.counting_fallback(Some("v2")),
                )
                .await
                .unwrap();
            assert_eq!(entry.content, "v1");
            assert_eq!(entry.version, Some(1));
            assert_eq!(fixture.call_count(), 0);

            // ...once the logical expiry passed, callers still receive the stale value
            // immediately, and only the first one schedules a rebuild.
            MockClock::advance(Duration::from_secs(61));
            for _ in 0..5 {
                let entry = fixture
                    .cache
                    .query_with_logical_expire::<_, String, _, _>(
                        "warm:",
                        &1,
                        duration,
                        fixture.counting_fallback(Some("v2")),
                    )
                    .await
                    .unwrap();
                assert_eq!(entry.content, "v1");
            }

            // Drain the pool so the rebuild definitely ran...
            fixture.pool.shutdown().await;
            assert_eq!(fixture.call_count(), 1);

            // ...after which the refreshed value with a bumped version and a new expiry
            // is served.
            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    duration,
                    fixture.counting_fallback(Some("v3")),
                )
                .await
                .unwrap();
            assert_eq!(entry.content, "v2");
            assert_eq!(entry.version, Some(2));
            assert_eq!(entry.is_fresh(clock::unix_millis()), true);
            assert_eq!(fixture.call_count(), 1);
        });
    }

    #[test]
    fn logical_expire_swallows_failed_rebuilds() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let duration = Duration::from_secs(60);

            fixture
                .cache
                .put_with_logical_expire("warm:", Some(&1), &"v1".to_owned(), duration)
                .await
                .unwrap();
            MockClock::advance(Duration::from_secs(61));

            // The scheduled rebuild fails...
            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>("warm:", &1, duration, || async {
                    Err(anyhow::anyhow!("database down"))
                })
                .await
                .unwrap();
            assert_eq!(entry.content, "v1");

            fixture.pool.shutdown().await;

            // ...the stale value stays authoritative and the lock was released, so the
            // next reader can schedule a new rebuild (which now runs inline as the pool
            // is gone).
            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    duration,
                    fixture.counting_fallback(Some("v2")),
                )
                .await
                .unwrap();
            assert_eq!(entry.content, "v1");
            assert_eq!(fixture.call_count(), 1);

            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    duration,
                    fixture.counting_fallback(Some("v3")),
                )
                .await
                .unwrap();
            assert_eq!(entry.content, "v2");
        });
    }

    #[test]
    fn rebuilds_discard_their_result_when_a_newer_version_appears() {
        crate::testing::test_async(async {
            let fixture = fixture();
            let duration = Duration::from_secs(60);

            fixture
                .cache
                .put_with_logical_expire("warm:", Some(&1), &"v1".to_owned(), duration)
                .await
                .unwrap();
            MockClock::advance(Duration::from_secs(61));

            // A reader schedules a rebuild (which stays queued for now)...
            let _ = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    duration,
                    fixture.counting_fallback(Some("rebuilt")),
                )
                .await
                .unwrap();

            // ...meanwhile a direct write bumps the version...
            fixture
                .cache
                .put_with_logical_expire("warm:", Some(&1), &"direct".to_owned(), duration)
                .await
                .unwrap();

            // ...so once the rebuild runs, it observes the newer version and discards its
            // own result.
            fixture.pool.shutdown().await;
            assert_eq!(fixture.call_count(), 1);

            let entry = fixture
                .cache
                .query_with_logical_expire::<_, String, _, _>(
                    "warm:",
                    &1,
                    duration,
                    fixture.counting_fallback(Some("never")),
                )
                .await
                .unwrap();
            assert_eq!(entry.content, "direct");
            assert_eq!(entry.version, Some(2));
        });
    }

    #[test]
    fn purge_deletes_matching_keys() {
        crate::testing::test_async(async {
            let fixture = fixture();

            fixture.cache.put("user:1", "a", None).await.unwrap();
            fixture.cache.put("user:2", "b", None).await.unwrap();
            fixture.cache.put("order:1", "c", None).await.unwrap();

            assert_eq!(fixture.cache.purge("^user:").await.unwrap(), 2);
            assert_eq!(fixture.cache.delete("order:1").await.unwrap(), true);
            assert_eq!(fixture.cache.delete("user:1").await.unwrap(), false);
        });
    }

    #[test]
    fn stats_report_the_observed_operations() {
        crate::testing::test_async(async {
            let fixture = fixture();

            let _ = fixture
                .cache
                .query_with_pass_through(
                    "product:",
                    &1,
                    Duration::from_secs(60),
                    fixture.counting_fallback(Some("value")),
                )
                .await
                .unwrap();
            let _ = fixture
                .cache
                .query_with_pass_through(
                    "product:",
                    &1,
                    Duration::from_secs(60),
                    fixture.counting_fallback(Some("value")),
                )
                .await
                .unwrap();

            let stats = fixture.cache.stats();
            assert_eq!(stats.contains("Cache Hits"), true);
            assert_eq!(stats.contains("Misses"), true);
            assert_eq!(stats.contains("Avg. Fallback"), true);
        });
    }
}
