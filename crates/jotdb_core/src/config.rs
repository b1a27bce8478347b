//! Store configuration.

use jotdb_engine::EngineOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend selection.
///
/// Backends are independent variants behind one contract; a collection
/// binds to exactly one, chosen here. There is no inheritance hierarchy
/// to configure - only the variant.
#[derive(Debug, Clone)]
pub enum Backend {
    /// JSON snapshot + WAL + lock file per collection, under the given
    /// data directory.
    File {
        /// Directory holding the per-collection files.
        dir: PathBuf,
    },
    /// In-process map, no persistence.
    Memory,
    /// One SQLite database file per collection, under the given data
    /// directory.
    Sqlite {
        /// Directory holding the per-collection database files.
        dir: PathBuf,
    },
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which backend newly referenced collections bind to.
    pub backend: Backend,

    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Capacity of each collection's record cache.
    pub cache_capacity: usize,

    /// Whether the file engine fsyncs the WAL on every append.
    pub sync_on_write: bool,

    /// Whether the file engine pretty-prints snapshots.
    pub pretty_snapshots: bool,

    /// Age after which a lock file is considered abandoned.
    pub lock_stale_after: Duration,
}

impl Config {
    /// Creates a configuration for the given backend with default
    /// tuning.
    #[must_use]
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            create_if_missing: true,
            cache_capacity: jotdb_engine::DEFAULT_CACHE_CAPACITY,
            sync_on_write: true,
            pretty_snapshots: true,
            lock_stale_after: jotdb_engine::DEFAULT_LOCK_STALE_AFTER,
        }
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the per-collection cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets whether the WAL is fsynced on every append.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether snapshots are pretty-printed.
    #[must_use]
    pub const fn pretty_snapshots(mut self, value: bool) -> Self {
        self.pretty_snapshots = value;
        self
    }

    /// Sets the lock staleness window.
    #[must_use]
    pub const fn lock_stale_after(mut self, value: Duration) -> Self {
        self.lock_stale_after = value;
        self
    }

    /// Returns the engine-level options this configuration implies.
    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cache_capacity: self.cache_capacity,
            sync_on_write: self.sync_on_write,
            pretty_snapshots: self.pretty_snapshots,
            lock_stale_after: self.lock_stale_after,
        }
    }
}

impl Default for Config {
    /// An in-memory store; the zero-setup default for tests and
    /// development.
    fn default() -> Self {
        Self::new(Backend::Memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_memory() {
        let config = Config::default();
        assert!(matches!(config.backend, Backend::Memory));
        assert!(config.create_if_missing);
        assert!(config.sync_on_write);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new(Backend::Memory)
            .cache_capacity(10)
            .sync_on_write(false)
            .pretty_snapshots(false)
            .lock_stale_after(Duration::from_secs(60));

        assert_eq!(config.cache_capacity, 10);
        assert!(!config.sync_on_write);
        assert!(!config.pretty_snapshots);

        let options = config.engine_options();
        assert_eq!(options.cache_capacity, 10);
        assert_eq!(options.lock_stale_after, Duration::from_secs(60));
    }
}
