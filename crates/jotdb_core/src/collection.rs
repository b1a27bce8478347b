//! Collection facade.

use crate::error::{StoreError, StoreResult};
use jotdb_engine::{EngineState, StorageEngine};
use jotdb_record::{Query, Record};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// A named collection bound to exactly one storage backend instance.
///
/// The facade delegates every operation to its engine after asserting
/// that `init()` completed. That assertion is the facade's only
/// independent logic: it turns "used before ready" bugs into an
/// immediate, named [`StoreError::NotInitialized`] failure instead of
/// undefined backend behavior.
///
/// Operations on one collection observe a total order equal to
/// lock-acquisition order; the engine's in-memory structures are never
/// touched concurrently.
pub struct Collection {
    name: String,
    engine: Mutex<Box<dyn StorageEngine>>,
}

impl Collection {
    pub(crate) fn new(name: String, engine: Box<dyn StorageEngine>) -> Self {
        Self {
            name,
            engine: Mutex::new(engine),
        }
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when the collection finished initialization.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.engine.lock().state() == EngineState::Ready
    }

    /// Initializes the backend: loads persisted state, replays the WAL,
    /// rebuilds indexes. Idempotent.
    pub fn init(&self) -> StoreResult<()> {
        self.engine.lock().init()?;
        Ok(())
    }

    fn assert_ready(&self, engine: &dyn StorageEngine) -> StoreResult<()> {
        if engine.state() == EngineState::Ready {
            Ok(())
        } else {
            Err(StoreError::not_initialized(&self.name))
        }
    }

    /// Returns the live record with the given id, or `None`.
    pub fn get(&self, id: &str) -> StoreResult<Option<Record>> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.get(id)?)
    }

    /// Returns all live records matching the filter, unordered.
    ///
    /// The filter maps field names to literal values or operator
    /// objects; see [`Query`] for the recognized operators.
    pub fn find(&self, filter: &Map<String, Value>) -> StoreResult<Vec<Record>> {
        let query = Query::parse(filter)?;
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.find(&query)?)
    }

    /// Inserts a record, assigning an id and timestamps when absent.
    pub fn insert(&self, data: Map<String, Value>) -> StoreResult<Record> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.insert(data)?)
    }

    /// Merges `data` over the live record with the given id.
    pub fn update(&self, id: &str, data: Map<String, Value>) -> StoreResult<Record> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.update(id, data)?)
    }

    /// Soft-deletes the live record with the given id.
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.delete(id)?)
    }

    /// Registers and builds an index on the ordered field-set.
    pub fn create_index(&self, fields: &[String]) -> StoreResult<()> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.create_index(fields)?)
    }

    /// Drops the index on the ordered field-set.
    pub fn drop_index(&self, fields: &[String]) -> StoreResult<()> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.drop_index(fields)?)
    }

    /// Clears and re-derives the index from scratch.
    pub fn rebuild_index(&self, fields: &[String]) -> StoreResult<()> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.rebuild_index(fields)?)
    }

    /// Physically removes soft-deleted records and clears the WAL.
    pub fn compact(&self) -> StoreResult<bool> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.compact()?)
    }

    /// Writes a timestamped backup into `dir`; returns the path written.
    pub fn backup(&self, dir: &Path) -> StoreResult<PathBuf> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.backup(dir)?)
    }

    /// Replaces the collection's state wholesale from a backup file.
    pub fn restore(&self, path: &Path) -> StoreResult<bool> {
        let mut engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.restore(path)?)
    }

    /// Returns the number of live records.
    pub fn len(&self) -> StoreResult<usize> {
        let engine = self.engine.lock();
        self.assert_ready(&**engine)?;
        Ok(engine.len()?)
    }

    /// Returns true when the collection holds no live records.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Finalizes backend handles without deleting data.
    pub fn close(&self) -> StoreResult<()> {
        self.engine.lock().close()?;
        Ok(())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
