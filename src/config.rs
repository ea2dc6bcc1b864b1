//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the
//! **config/settings.yml** file. Note that we observe this file for changes and reload it
//! once a change is detected. Therefore each user of the config should attach itself to
//! the [Config::notifier](Config::notifier) and re-process the settings once a change
//! message is received - a caching layer should never require a restart just to pick up
//! new timings.
//!
//! All durations are given as strings like "50ms" or "15m" (see
//! [parse_duration](crate::fmt::parse_duration)). A fully populated file looks like this:
//!
//! ```yaml
//! cache:
//!     # Bounds the wait for the rebuild lock in the mutex strategy.
//!     lock_wait: 200ms
//!     # Bounds how long a rebuild may hold its lock before it auto-releases.
//!     lock_lease: 10s
//!     # The pause between two lock attempts of the mutex strategy.
//!     retry_interval: 50ms
//!     # How often the mutex strategy re-attempts before giving up.
//!     retry_attempts: 3
//!     # TTL for negative result markers. If omitted, a tenth of the entry TTL is used.
//!     empty_ttl: 30s
//! pool:
//!     # Number of background workers executing cache rebuilds.
//!     workers: 16
//!     # Capacity of the task queue. Once full, submitters run tasks themselves.
//!     queue: 4096
//! id_generator:
//!     # Identity of this process within the deployment. Both must be within [0, 31].
//!     datacenter: 0
//!     machine: 0
//! ```
//!
//! Missing keys fall back to their defaults; malformed values are reported and likewise
//! fall back, so a config typo can never take the caching layer down.
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::{format_duration, parse_duration};
use crate::platform::Platform;
use anyhow::Context;
use std::path::Path;

/// Contains the timing knobs of the cache orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSettings {
    /// Bounds the wait for the rebuild lock in the mutex strategy.
    pub lock_wait: Duration,

    /// Bounds how long a rebuild may hold its lock before it auto-releases.
    pub lock_lease: Duration,

    /// The pause between two lock attempts of the mutex strategy.
    pub retry_interval: Duration,

    /// How often the mutex strategy re-attempts before returning a degraded result.
    pub retry_attempts: usize,

    /// TTL for negative result markers. **None** derives a tenth of the entry TTL.
    pub empty_ttl: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            lock_wait: Duration::from_millis(200),
            lock_lease: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
            retry_attempts: 3,
            empty_ttl: None,
        }
    }
}

/// Contains the sizing of the background worker pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    /// Number of background workers executing cache rebuilds.
    pub workers: usize,

    /// Capacity of the task queue.
    pub queue_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            workers: num_cpus::get().max(1),
            queue_size: 4096,
        }
    }
}

/// Contains the identity of the id generator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdGeneratorSettings {
    /// The datacenter this process runs in (0..=31).
    pub datacenter: u64,

    /// The machine within the datacenter (0..=31).
    pub machine: u64,
}

/// Bundles all known settings sections.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    /// Timings of the cache orchestrator.
    pub cache: CacheSettings,

    /// Sizing of the background pool.
    pub pool: PoolSettings,

    /// Identity of the id generator.
    pub id_generator: IdGeneratorSettings,
}

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder)
/// and can be obtained via `platform.require::<Config>()`. Note that it is highly
/// recommended to register a change listener by calling [Config::notifier](Config::notifier)
/// as we expect all components to pick up config changes without restarting the
/// application.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    settings: ArcSwap<Settings>,
    last_loaded: Mutex<Option<SystemTime>>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being
/// broadcast can and should be ignored. All that matters is, once a message has been
/// received, the config was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install](install) function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            settings: ArcSwap::new(Arc::new(Settings::default())),
            last_loaded: Mutex::new(None),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains the currently loaded settings.
    ///
    /// Note that this snapshot should not be stored or kept around for long, as it will
    /// not be updated once a new config has been loaded.
    pub fn current(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as
    /// an unmounted docker volume is always presented as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked
    /// manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!(
                    "Config file doesn't exist or is an unmounted docker volume - skipping config load."
                );
                return Ok(());
            }
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to
    /// load a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use palisade::config::Config;
    /// # use std::time::Duration;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// cache:
    ///     lock_wait: 500ms
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().cache.lock_wait, Duration::from_millis(500));
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        let settings = match docs.first() {
            Some(doc @ Yaml::Hash(_)) => parse_settings(doc),
            _ => Settings::default(),
        };

        // Store the updated settings...
        self.settings.store(Arc::new(settings));
        *self.last_loaded.lock().unwrap() = last_modified;

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.clone().send(());

        Ok(())
    }
}

/// Transforms the given YAML document into typed settings.
///
/// Missing sections or keys keep their defaults. An unparseable value is reported and
/// also keeps its default - a broken config must never take the caching layer down.
fn parse_settings(doc: &Yaml) -> Settings {
    let defaults = Settings::default();

    Settings {
        cache: CacheSettings {
            lock_wait: read_duration(
                &doc["cache"]["lock_wait"],
                "cache.lock_wait",
                defaults.cache.lock_wait,
            ),
            lock_lease: read_duration(
                &doc["cache"]["lock_lease"],
                "cache.lock_lease",
                defaults.cache.lock_lease,
            ),
            retry_interval: read_duration(
                &doc["cache"]["retry_interval"],
                "cache.retry_interval",
                defaults.cache.retry_interval,
            ),
            retry_attempts: read_count(
                &doc["cache"]["retry_attempts"],
                "cache.retry_attempts",
                defaults.cache.retry_attempts,
            ),
            empty_ttl: read_optional_duration(&doc["cache"]["empty_ttl"], "cache.empty_ttl"),
        },
        pool: PoolSettings {
            workers: read_count(&doc["pool"]["workers"], "pool.workers", defaults.pool.workers),
            queue_size: read_count(
                &doc["pool"]["queue"],
                "pool.queue",
                defaults.pool.queue_size,
            ),
        },
        id_generator: IdGeneratorSettings {
            datacenter: read_id(
                &doc["id_generator"]["datacenter"],
                "id_generator.datacenter",
            ),
            machine: read_id(&doc["id_generator"]["machine"], "id_generator.machine"),
        },
    }
}

fn read_duration(yaml: &Yaml, path: &str, fallback: Duration) -> Duration {
    match read_optional_duration(yaml, path) {
        Some(duration) => duration,
        None => fallback,
    }
}

fn read_optional_duration(yaml: &Yaml, path: &str) -> Option<Duration> {
    match yaml {
        Yaml::BadValue => None,
        Yaml::Integer(millis) if *millis >= 0 => Some(Duration::from_millis(*millis as u64)),
        value => match value.as_str().map(parse_duration) {
            Some(Ok(duration)) => Some(duration),
            _ => {
                log::error!(
                    "Ignoring invalid duration for '{}' (expected something like '{}').",
                    path,
                    format_duration(Duration::from_millis(50))
                );
                None
            }
        },
    }
}

fn read_count(yaml: &Yaml, path: &str, fallback: usize) -> usize {
    match yaml {
        Yaml::BadValue => fallback,
        value => match value.as_i64().filter(|count| *count > 0) {
            Some(count) => count as usize,
            None => {
                log::error!("Ignoring invalid value for '{}' - using {}.", path, fallback);
                fallback
            }
        },
    }
}

fn read_id(yaml: &Yaml, path: &str) -> u64 {
    match yaml {
        Yaml::BadValue => 0,
        value => match value.as_i64().filter(|id| *id >= 0) {
            Some(id) => id as u64,
            None => {
                log::error!("Ignoring invalid value for '{}' - using 0.", path);
                0
            }
        },
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This will read its contents from **config/settings.yml** and also install a change
/// listener for this file. Note that this listener will only watch the "last modified"
/// date of the file and will not perform a structural comparison. Therefore it is the
/// duty of each config user to gracefully handle partial config changes.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless
/// the **Config** part is disabled.
pub async fn install(platform: Arc<Platform>) {
    // Create the "config" directory in case it doesn't exist...
    let path = Path::new("config").to_path_buf();
    if let Err(error) = tokio::fs::create_dir_all(path.clone()).await {
        log::warn!(
            "Failed to create config base directory {}: {}",
            path.to_string_lossy(),
            error
        )
    }

    // Install a config instance and point it to "settings.yml"..
    let config = Arc::new(Config::new("config/settings.yml"));
    platform.register::<Config>(config.clone());

    // Actually try to read the file...
    if let Err(error) = config.load().await {
        log::error!("{}", error);
    }

    // Install a change listener which runs every 2s...
    run_config_change_monitor(platform, config);
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    let _ = tokio::spawn(async move {
        while platform.is_running() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            // This will contain the last modified date of the file on disk or be None if
            // the file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or be None if
            // no data has been loaded yet...
            let last_loaded = *config.last_loaded.lock().unwrap();

            // If a file is present and newer than the one previously loaded (or if none
            // has been loaded so far) -> perform a reload and broadcast an update if the
            // file has been successfully loaded...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => {
                        log::info!("System configuration was re-loaded.");
                    }
                    Err(error) => log::error!("Failed to re-load system config: {}", error),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = Config::new("test.yml");
        config.load_from_string("unrelated: 42", None).unwrap();

        assert_eq!(*config.current(), Settings::default());
    }

    #[test]
    fn settings_are_parsed() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
cache:
    lock_wait: 1s
    lock_lease: 30s
    retry_interval: 25ms
    retry_attempts: 5
    empty_ttl: 2m
pool:
    workers: 4
    queue: 128
id_generator:
    datacenter: 3
    machine: 9
",
                None,
            )
            .unwrap();

        let settings = config.current();
        assert_eq!(settings.cache.lock_wait, Duration::from_secs(1));
        assert_eq!(settings.cache.lock_lease, Duration::from_secs(30));
        assert_eq!(settings.cache.retry_interval, Duration::from_millis(25));
        assert_eq!(settings.cache.retry_attempts, 5);
        assert_eq!(settings.cache.empty_ttl, Some(Duration::from_secs(120)));
        assert_eq!(settings.pool.workers, 4);
        assert_eq!(settings.pool.queue_size, 128);
        assert_eq!(settings.id_generator.datacenter, 3);
        assert_eq!(settings.id_generator.machine, 9);
    }

    #[test]
    fn malformed_values_keep_their_defaults() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
cache:
    lock_wait: soon
    retry_attempts: -3
pool:
    workers: many
",
                None,
            )
            .unwrap();

        let settings = config.current();
        let defaults = Settings::default();
        assert_eq!(settings.cache.lock_wait, defaults.cache.lock_wait);
        assert_eq!(settings.cache.retry_attempts, defaults.cache.retry_attempts);
        assert_eq!(settings.pool.workers, defaults.pool.workers);
    }

    #[test]
    fn malformed_yaml_is_rejected_and_keeps_the_previous_settings() {
        let config = Config::new("test.yml");
        config
            .load_from_string("cache:\n    retry_attempts: 7", None)
            .unwrap();
        assert_eq!(config.current().cache.retry_attempts, 7);

        assert_eq!(
            config.load_from_string("cache: 'unterminated", None).is_err(),
            true
        );
        assert_eq!(config.current().cache.retry_attempts, 7);
    }

    #[test]
    fn listeners_are_notified_on_change() {
        crate::testing::test_async(async {
            let config = Config::new("test.yml");
            let mut notifier = config.notifier();

            config.load_from_string("pool:\n    workers: 2", None).unwrap();
            assert_eq!(notifier.recv().await.is_ok(), true);
            assert_eq!(config.current().pool.workers, 2);
        });
    }
}
