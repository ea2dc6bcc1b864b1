//! Defines the contract towards the backing key-value store.
//!
//! The cache orchestrator treats the store as an external collaborator: all it needs are
//! the narrow operations defined by [Store](Store). Values are opaque byte strings - the
//! [values](crate::values) module decides what they mean.
//!
//! A deployment would typically implement this trait on top of a networked store shared
//! by all nodes. For tests and single node embeddings, [MemoryStore](MemoryStore)
//! provides a complete in-process implementation with TTL handling.
use crate::clock;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Describes the operations the caching layer requires from its backing store.
///
/// Implementations must be shareable across tasks. All operations are fallible as the
/// store is typically reached via the network.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetches the raw value stored for the given key or **None** if the key is absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Stores the given value for the given key.
    ///
    /// If a TTL is given, the key vanishes once it elapsed. Without a TTL the key lives
    /// until it is explicitly deleted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Re-assigns the TTL of the given key.
    ///
    /// Returns **false** if the key doesn't exist.
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Determines if a value is present for the given key.
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Deletes the value stored for the given key.
    ///
    /// Returns **true** if a value was actually removed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Returns all keys matching the given pattern (a regular expression).
    async fn scan(&self, pattern: &str) -> anyhow::Result<HashSet<String>>;
}

/// Keeps a stored value along with its expiry timestamp (unix millis).
struct StoredValue {
    data: Bytes,
    expires_at: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

/// Provides an in-process [Store](Store) used for tests and single node embeddings.
///
/// Expired entries are dropped lazily whenever they are touched - there is no background
/// eviction, which is perfectly fine for the intended usages.
///
/// # Example
///
/// ```
/// # use palisade::store::{MemoryStore, Store};
/// # use bytes::Bytes;
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::new();
///
/// store.set("greeting", Bytes::from("hello"), None).await.unwrap();
/// assert_eq!(store.get("greeting").await.unwrap(), Some(Bytes::from("hello")));
///
/// assert_eq!(store.delete("greeting").await.unwrap(), true);
/// assert_eq!(store.exists("greeting").await.unwrap(), false);
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = clock::unix_millis();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|value| value.is_live(now))
            .count()
    }

    /// Determines if the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let now = clock::unix_millis();
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(value) if value.is_live(now) => Ok(Some(value.data.clone())),
            Some(_) => {
                let _ = entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires_at = ttl.map(|ttl| clock::unix_millis() + ttl.as_millis() as u64);
        let _ = self.entries.lock().unwrap().insert(
            key.to_owned(),
            StoredValue {
                data: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = clock::unix_millis();
        let mut entries = self.entries.lock().unwrap();

        match entries.get_mut(key) {
            Some(value) if value.is_live(now) => {
                value.expires_at = Some(now + ttl.as_millis() as u64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let now = clock::unix_millis();
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(|value| value.is_live(now))
            .unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let now = clock::unix_millis();
        match self.entries.lock().unwrap().remove(key) {
            Some(value) => Ok(value.is_live(now)),
            None => Ok(false),
        }
    }

    async fn scan(&self, pattern: &str) -> anyhow::Result<HashSet<String>> {
        let matcher = regex::Regex::new(pattern)?;
        let now = clock::unix_millis();

        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, value)| value.is_live(now) && matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
