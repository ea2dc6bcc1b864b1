//! Defines the unit of data managed per cache key.
use serde::{Deserialize, Serialize};

/// Represents a cached value along with its bookkeeping fields.
///
/// An entry is both what the logical-expiry strategy persists in the store and what every
/// query hands back to its caller:
///
/// * `exists` tells whether a value (possibly a negative result) has been materialized
///   for this key. A negative result carries the zero value as content.
/// * `version` is assigned monotonically per key; a rebuild which observes a newer
///   version than the one it started from discards its own result.
/// * `retry_later` is set when a rebuild could not complete (lock not obtained, fallback
///   failed) - the caller received a best-effort result, not a fresh one.
/// * `logical_expire_at` is only present on logical-expiry entries. Such entries carry no
///   physical TTL; staleness is judged by this field alone.
///
/// # Examples
///
/// ```
/// # use palisade::cache::CacheEntry;
/// let entry = CacheEntry::hit(42).with_version(3);
/// assert_eq!(entry.exists, true);
/// assert_eq!(entry.content, 42);
/// assert_eq!(entry.version, Some(3));
///
/// let absent = CacheEntry::<i64>::absent();
/// assert_eq!(absent.exists, false);
/// assert_eq!(absent.content, 0);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Indicates that a value has been materialized for this key.
    pub exists: bool,

    /// The monotonically assigned version of this entry, if any.
    #[serde(default)]
    pub version: Option<i64>,

    /// Indicates that the rebuild protocol could not complete and the caller should come
    /// back later.
    #[serde(default)]
    pub retry_later: bool,

    /// The decoded business payload (the zero value for negative results).
    pub content: T,

    /// The logical expiry timestamp (unix millis), present on logical-expiry entries.
    #[serde(default)]
    pub logical_expire_at: Option<u64>,
}

impl<T> CacheEntry<T> {
    /// Creates an entry carrying the given materialized content.
    pub fn hit(content: T) -> Self {
        CacheEntry {
            exists: true,
            version: None,
            retry_later: false,
            content,
            logical_expire_at: None,
        }
    }

    /// Assigns the given version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Assigns the given logical expiry timestamp (unix millis).
    pub fn with_logical_expiry(mut self, expire_at: u64) -> Self {
        self.logical_expire_at = Some(expire_at);
        self
    }

    /// Determines if this entry is still fresh at the given timestamp.
    ///
    /// Entries without a logical expiry never turn stale by themselves (their lifetime is
    /// governed by the store TTL instead).
    pub fn is_fresh(&self, now: u64) -> bool {
        match self.logical_expire_at {
            Some(expire_at) => expire_at > now,
            None => true,
        }
    }

    /// Unwraps the entry into its content.
    pub fn into_content(self) -> T {
        self.content
    }
}

impl<T: Default> CacheEntry<T> {
    /// Creates an entry representing a confirmed absence (a negative result).
    pub fn absent() -> Self {
        CacheEntry {
            exists: false,
            version: None,
            retry_later: false,
            content: T::default(),
            logical_expire_at: None,
        }
    }

    /// Creates an entry signalling that the rebuild could not complete and the caller
    /// should retry later.
    pub fn degraded() -> Self {
        CacheEntry {
            exists: false,
            version: None,
            retry_later: true,
            content: T::default(),
            logical_expire_at: None,
        }
    }
}
