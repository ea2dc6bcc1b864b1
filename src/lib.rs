//! Palisade is a resilient read-through caching layer for distributed applications.
//!
//! # Introduction
//! Applications which sit in front of a slow source of truth (a relational database, a
//! search cluster, a remote service) usually put a cache in between. That works fine
//! until load patterns conspire against the cache itself:
//!
//! * **Cache penetration** - clients repeatedly ask for keys which exist neither in the
//!   cache nor in the source of truth. Every single lookup falls through.
//! * **Cache breakdown** - one hot key expires and a thundering herd of requests rebuilds
//!   it simultaneously, all hitting the source of truth at once.
//! * **Cache avalanche** - many keys expire at the same instant and the re-population
//!   load spikes.
//!
//! **Palisade** packages the three classic countermeasures as read-through query
//! strategies: negative result caching (*pass-through*), stale-while-revalidate with a
//! background rebuild (*logical expiry*) and lock guarded rebuilds (*mutex*). The caller
//! always supplies a fallback closure which computes the authoritative value - the
//! strategies decide if, when and under which protection it actually runs.
//!
//! A companion module generates globally unique, time-ordered 64 bit ids which are
//! commonly used as record identifiers and cache key components in such deployments.
//!
//! # Features
//! * **100% Async/Await** - all cache operations build upon [tokio](https://tokio.rs/)
//!   and async/await primitives as provided by Rust. Background rebuilds run on a
//!   bounded worker pool which degrades to caller-executed work under pressure instead
//!   of dropping anything.
//! * **Narrow collaborator contracts**. The backing store and the distributed lock
//!   service are consumed through two small traits ([store::Store](store::Store),
//!   [lock::LockProvider](lock::LockProvider)) - in-process reference implementations
//!   are included for tests and single node setups.
//! * **Reload-aware config facility** which permits to update all cache timings during
//!   operation. No restart is ever required, which matters for a layer whose whole point
//!   is protecting warm state.
//! * **Simple and well documented code base**. Palisade isn't a large framework at all.
//!   This permits every user to browse and understand its source code and to know what to
//!   expect from the system.
//!
//! # Modules
//! * **cache**: The read-through strategies and their orchestrator. See [crate::cache].
//! * **snowflake**: The 64 bit id generator. See [crate::snowflake].
//! * **keys** / **values**: The pure codec functions for cache keys and stored values.
//! * **store** / **lock** / **pool**: The collaborator contracts and process-local
//!   implementations.
//!
//! # Example
//! ```no_run
//! # use palisade::builder::Builder;
//! # use palisade::cache::CacheOrchestrator;
//! # use std::time::Duration;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     let cache = platform.require::<CacheOrchestrator>();
//!     let product = cache
//!         .query_with_pass_through("product:", &42, Duration::from_secs(60), || async {
//!             // ...fetch the product from the database here...
//!             Ok(Some("Telescope".to_owned()))
//!         })
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(product.content, "Telescope");
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod cache;
pub mod clock;
pub mod config;
pub mod fmt;
pub mod keys;
pub mod lock;
pub mod platform;
pub mod pool;
pub mod signals;
pub mod snowflake;
pub mod store;
pub mod values;

/// Contains the version of the palisade library.
pub const PALISADE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the palisade build being used.
pub const PALISADE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to
/// set up the framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging
    // system is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate palisade;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
