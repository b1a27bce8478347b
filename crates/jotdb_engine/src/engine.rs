//! Storage engine trait definition.

use crate::error::EngineResult;
use jotdb_record::{Query, Record};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Initialization state of a storage engine.
///
/// Engines advance `Uninitialized -> LoadingSnapshot -> ReplayingWal ->
/// RebuildingIndexes -> Ready` during [`StorageEngine::init`]; any error
/// moves them to `Failed`. Operations other than `init` require `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No initialization attempted yet.
    Uninitialized,
    /// Loading the persisted snapshot.
    LoadingSnapshot,
    /// Replaying pending WAL entries onto the snapshot.
    ReplayingWal,
    /// Rebuilding registered indexes from the recovered record set.
    RebuildingIndexes,
    /// Fully initialized; all operations available.
    Ready,
    /// Initialization failed; the error was surfaced to the caller.
    Failed,
}

/// Construction options shared by all engine variants.
///
/// Options an engine has no use for (the lock staleness window on the
/// in-memory engine, say) are simply ignored.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Capacity of the per-engine record cache.
    pub cache_capacity: usize,
    /// Whether to fsync the WAL after every append (safer but slower).
    pub sync_on_write: bool,
    /// Whether snapshots are written pretty-printed.
    pub pretty_snapshots: bool,
    /// Age after which a lock file is considered abandoned.
    pub lock_stale_after: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_capacity: crate::cache::DEFAULT_CACHE_CAPACITY,
            sync_on_write: true,
            pretty_snapshots: true,
            lock_stale_after: crate::lock::DEFAULT_LOCK_STALE_AFTER,
        }
    }
}

/// A storage backend for one collection of records.
///
/// Engines are **record stores**: they own the record set, the indexes,
/// and the cache for exactly one collection. The three implementations
/// ([`crate::FileEngine`], [`crate::MemoryEngine`], [`crate::SqliteEngine`])
/// are interchangeable behind this trait and are selected by
/// configuration.
///
/// # Invariants
///
/// - `insert` assigns an id when absent and stamps timestamps; ids are
///   immutable afterwards
/// - a deleted record is invisible to `get`/`find` immediately, but only
///   `compact` removes it physically
/// - every mutation keeps all registered indexes consistent with the
///   live record set
/// - all operations except `init` fail on an engine that is not `Ready`
///
/// Engines are `Send` but not `Sync`: the owning collection serializes
/// access behind a mutex, so operations on one collection observe a
/// total order and never run concurrently on shared structures.
pub trait StorageEngine: Send {
    /// Returns the engine's initialization state.
    fn state(&self) -> EngineState;

    /// Initializes the engine: loads persisted state, replays the WAL,
    /// rebuilds indexes. Idempotent - calling again after success is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error (and moves to `Failed`) if the lock is held, the
    /// snapshot or WAL is corrupted, or the backend cannot be opened.
    fn init(&mut self) -> EngineResult<()>;

    /// Returns the live record with the given id, or `None` when absent
    /// or soft-deleted. Served from the cache when possible.
    fn get(&mut self, id: &str) -> EngineResult<Option<Record>>;

    /// Returns all live records matching the query, unordered.
    ///
    /// Always reads the backend's source of truth, never the cache.
    fn find(&mut self, query: &Query) -> EngineResult<Vec<Record>>;

    /// Inserts a record, assigning an id and timestamps. Returns the
    /// stored record.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` when an explicit id collides with a live
    /// record.
    fn insert(&mut self, data: Map<String, Value>) -> EngineResult<Record>;

    /// Merges `data` shallowly over the live record with the given id
    /// and re-stamps `_updated`. Returns the merged record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no live record matches.
    fn update(&mut self, id: &str, data: Map<String, Value>) -> EngineResult<Record>;

    /// Soft-deletes the live record with the given id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no live record matches.
    fn delete(&mut self, id: &str) -> EngineResult<bool>;

    /// Registers an index on the ordered field-set and builds it from
    /// the live record set. No-op when the exact field-set is already
    /// indexed.
    fn create_index(&mut self, fields: &[String]) -> EngineResult<()>;

    /// Drops the index on the ordered field-set, if registered.
    fn drop_index(&mut self, fields: &[String]) -> EngineResult<()>;

    /// Clears and re-derives the index from scratch, registering it
    /// first when absent.
    fn rebuild_index(&mut self, fields: &[String]) -> EngineResult<()>;

    /// Physically removes soft-deleted records, clears the WAL and the
    /// cache, and rebuilds all indexes.
    fn compact(&mut self) -> EngineResult<bool>;

    /// Writes a timestamped copy of the collection's persisted state
    /// into `dir` and returns the path written.
    fn backup(&mut self, dir: &Path) -> EngineResult<PathBuf>;

    /// Replaces the collection's state wholesale from the given backup
    /// file, persists it, clears the cache, and rebuilds indexes.
    fn restore(&mut self, path: &Path) -> EngineResult<bool>;

    /// Returns the number of live records.
    fn len(&self) -> EngineResult<usize>;

    /// Returns true when the collection holds no live records.
    fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Finalizes backend handles (lock file, connections) without
    /// deleting data. The engine returns to `Uninitialized` and may be
    /// initialized again.
    fn close(&mut self) -> EngineResult<()>;
}
