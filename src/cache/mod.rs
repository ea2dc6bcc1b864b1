//! Provides the read-through caching layer with its three query strategies.
//!
//! All strategies share one shape: the caller names a key (prefix + optional identifier)
//! and supplies a fallback which computes the authoritative value from the source of
//! truth. The strategies differ in how they behave once the cached value is missing or
//! stale - each one counters a different way caches fall over under load:
//!
//! * **Pass-through** answers misses by running the fallback and caching the result. Its
//!   specialty is the *negative* result: a key confirmed to exist nowhere is remembered
//!   under a short TTL, so repeated lookups for non-existent keys (cache penetration)
//!   cannot hammer the source of truth.
//! * **Logical expiry** never lets a reader wait. Values carry an application level
//!   expiry timestamp instead of a store TTL; a stale value is served immediately while
//!   a single background rebuild (guarded by the distributed lock) refreshes it. Mass
//!   expiry therefore causes background work, not a synchronized stampede (cache
//!   avalanche) - at the price of briefly serving stale data.
//! * **Mutex** makes callers of one cold or expired hot key queue up on the distributed
//!   lock: exactly one of them rebuilds, everyone else re-reads its result (cache
//!   breakdown). Waits are bounded; a caller which never gets the lock receives a
//!   degraded `retry_later` answer rather than blocking forever.
//!
//! A key must stick to one strategy: the per-key rebuild contracts differ and are not
//! coordinated across strategies.
//!
//! The [CacheOrchestrator](CacheOrchestrator) exposes each strategy with an
//! identifier-parameterized and a no-argument form, and with a scalar and a list
//! returning form. [install](install) wires an orchestrator from the system config and
//! keeps its timings updated on config changes.
mod entry;
mod orchestrator;

pub use entry::CacheEntry;
pub use orchestrator::{install, CacheOrchestrator};
