//! Provides a builder which can be used to setup and initialize the framework.
//!
//! This can be used to create and setup the central parts of the framework. As palisade
//! provides some optional modules, a builder permits to selectively enable or disable
//! them.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use palisade::builder::Builder;
//! # use palisade::cache::CacheOrchestrator;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Fetch the cache and issue queries...
//!     let cache = platform.require::<CacheOrchestrator>();
//! }
//! ```
use std::sync::Arc;

use crate::lock::{LocalLockProvider, LockProvider};
use crate::platform::Platform;
use crate::store::{MemoryStore, Store};
use crate::{init_logging, PALISADE_REVISION, PALISADE_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As palisade provides a bunch of components of which some are optional, the actual
/// setup can be configured here. Note that the config has to be enabled whenever the
/// pool, the id generator or the cache is, as these read their settings from it.
///
/// By default, the cache operates on an in-process [MemoryStore](crate::store::MemoryStore)
/// and [LocalLockProvider](crate::lock::LocalLockProvider). A distributed deployment
/// supplies its shared store and lock service via [with_store](Builder::with_store) and
/// [with_lock_provider](Builder::with_lock_provider).
///
/// # Example
/// ```no_run
/// # use palisade::builder::Builder;
/// # use palisade::cache::CacheOrchestrator;
/// #[tokio::main]
/// async fn main() {
///     let platform = Builder::new().enable_all().build().await;
///     let cache = platform.require::<CacheOrchestrator>();
/// }
/// ```
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_pool: bool,
    setup_id_generator: bool,
    setup_cache: bool,
    store: Option<Arc<dyn Store>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is
    /// quite convenient, but be aware that new components which might be added in a
    /// library update will then also be enabled by default. This might or might not be
    /// the expected behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_pool = true;
        self.setup_id_generator = true;
        self.setup_cache = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend
    /// palisade to be run in docker containers, this is all that is needed for proper
    /// logging. The date format being used is digestible by established tools like
    /// **greylog**.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the framework once **CTRL-C** or
    /// **SIGHUP** is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs the background [CachePool](crate::pool::CachePool).
    ///
    /// For more details see: [pool](crate::pool)
    pub fn enable_pool(mut self) -> Self {
        self.setup_pool = true;
        self
    }

    /// Disables setting up the background pool after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_pool(mut self) -> Self {
        self.setup_pool = false;
        self
    }

    /// Creates and installs the [IdGenerator](crate::snowflake::IdGenerator).
    ///
    /// For more details see: [snowflake](crate::snowflake)
    pub fn enable_id_generator(mut self) -> Self {
        self.setup_id_generator = true;
        self
    }

    /// Disables setting up the id generator after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_id_generator(mut self) -> Self {
        self.setup_id_generator = false;
        self
    }

    /// Creates and installs the [CacheOrchestrator](crate::cache::CacheOrchestrator).
    ///
    /// For more details see: [cache](crate::cache)
    pub fn enable_cache(mut self) -> Self {
        self.setup_cache = true;
        self
    }

    /// Disables setting up the cache after [enable_all()](Builder::enable_all) has been
    /// used.
    pub fn disable_cache(mut self) -> Self {
        self.setup_cache = false;
        self
    }

    /// Supplies the backing store shared across the deployment.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Supplies the distributed lock service shared across the deployment.
    pub fn with_lock_provider(mut self, lock_provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(lock_provider);
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the enabled
    /// components being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "|#| PALISADE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            PALISADE_VERSION,
            PALISADE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_pool {
            crate::pool::install(platform.clone());
        }

        if self.setup_id_generator {
            if let Err(error) = crate::snowflake::install(platform.clone()) {
                // The generator is not registered in this case - requiring it later will
                // fail loudly instead of handing out colliding ids.
                log::error!("Failed to set up the id generator: {:#}", error);
            }
        }

        if self.setup_cache {
            let store = self.store.unwrap_or_else(|| {
                let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
                store
            });
            let lock_provider = self.lock_provider.unwrap_or_else(|| {
                let lock_provider: Arc<dyn LockProvider> = Arc::new(LocalLockProvider::new());
                lock_provider
            });
            let _ = crate::cache::install(platform.clone(), store, lock_provider);
        }

        platform
    }
}
