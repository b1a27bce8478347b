//! Store facade: binds collection names to backend instances.

use crate::collection::Collection;
use crate::config::{Backend, Config};
use crate::error::{StoreError, StoreResult};
use jotdb_engine::{FileEngine, MemoryEngine, SqliteEngine, StorageEngine};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The store: one configuration, many named collections.
///
/// A collection handle is created when first referenced by name and
/// lives for the process lifetime; each binds to its own backend
/// instance chosen by [`Config::backend`]. Collections are independent
/// units of durability - there is no cross-collection ordering or
/// transaction.
pub struct Store {
    config: Config,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Store {
    /// Opens a store with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::MissingDirectory`] when the data
    /// directory does not exist and `create_if_missing` is off.
    pub fn open(config: Config) -> StoreResult<Self> {
        match &config.backend {
            Backend::File { dir } | Backend::Sqlite { dir } => {
                if !dir.exists() {
                    if config.create_if_missing {
                        std::fs::create_dir_all(dir).map_err(jotdb_engine::EngineError::from)?;
                    } else {
                        return Err(StoreError::MissingDirectory { path: dir.clone() });
                    }
                }
            }
            Backend::Memory => {}
        }
        Ok(Self {
            config,
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the collection handle for `name`, creating it (without
    /// initializing) on first reference.
    ///
    /// # Errors
    ///
    /// Fails when the name is empty or not usable as a file stem.
    pub fn collection(&self, name: &str) -> StoreResult<Arc<Collection>> {
        validate_name(name)?;
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing));
        }

        let mut collections = self.collections.write();
        // Re-check under the write lock; another caller may have won.
        if let Some(existing) = collections.get(name) {
            return Ok(Arc::clone(existing));
        }

        let engine = self.make_engine(name);
        let collection = Arc::new(Collection::new(name.to_string(), engine));
        collections.insert(name.to_string(), Arc::clone(&collection));
        debug!(collection = name, "created collection handle");
        Ok(collection)
    }

    /// Returns an initialized collection: [`Store::collection`] followed
    /// by [`Collection::init`].
    pub fn open_collection(&self, name: &str) -> StoreResult<Arc<Collection>> {
        let collection = self.collection(name)?;
        collection.init()?;
        Ok(collection)
    }

    /// Returns the names of all referenced collections.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes every collection, finalizing backend handles. Data is
    /// kept; collections may be re-initialized afterwards.
    pub fn close_all(&self) -> StoreResult<()> {
        for collection in self.collections.read().values() {
            collection.close()?;
        }
        Ok(())
    }

    fn make_engine(&self, name: &str) -> Box<dyn StorageEngine> {
        let options = self.config.engine_options();
        match &self.config.backend {
            Backend::File { dir } => Box::new(FileEngine::new(dir, name, options)),
            Backend::Memory => Box::new(MemoryEngine::new(name, options)),
            Backend::Sqlite { dir } => Box::new(SqliteEngine::new(dir, name, options)),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.config.backend)
            .field("collections", &self.collection_names())
            .finish_non_exhaustive()
    }
}

/// Collection names become file stems; keep them portable.
fn validate_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollectionName {
            name: name.to_string(),
        })
    }
}


/// Tests exercising the durable backends through the facade.
#[cfg(test)]
mod persistence_tests {
    use super::*;
    use serde_json::{json, Map, Value};
    use std::path::Path;
    use tempfile::tempdir;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn file_store(dir: &Path) -> Store {
        Store::open(Config::new(Backend::File {
            dir: dir.to_path_buf(),
        }))
        .unwrap()
    }

    #[test]
    fn file_backend_persists_across_stores() {
        let dir = tempdir().unwrap();
        let id;
        {
            let store = file_store(dir.path());
            let users = store.open_collection("users").unwrap();
            let record = users.insert(fields(&[("n", json!(7))])).unwrap();
            id = record.id().unwrap().to_string();
            store.close_all().unwrap();
        }
        {
            let store = file_store(dir.path());
            let users = store.open_collection("users").unwrap();
            assert_eq!(users.get(&id).unwrap().unwrap().get("n"), Some(&json!(7)));
        }
    }

    #[test]
    fn sqlite_backend_round_trip() {
        let dir = tempdir().unwrap();
        let store = Store::open(Config::new(Backend::Sqlite {
            dir: dir.path().to_path_buf(),
        }))
        .unwrap();

        let users = store.open_collection("users").unwrap();
        let record = users.insert(fields(&[("age", json!(30))])).unwrap();

        let hits = users.find(&fields(&[("age", json!({"$gte": 18}))])).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), record.id());
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");

        let result = Store::open(
            Config::new(Backend::File {
                dir: missing.clone(),
            })
            .create_if_missing(false),
        );
        assert!(matches!(result, Err(StoreError::MissingDirectory { .. })));

        // With the default, the directory is created.
        let store = Store::open(Config::new(Backend::File { dir: missing })).unwrap();
        store.open_collection("users").unwrap();
    }

    #[test]
    fn backup_restore_through_facade() {
        let dir = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let store = file_store(dir.path());
        let users = store.open_collection("users").unwrap();

        let a = users.insert(fields(&[("n", json!(1))])).unwrap();
        let path = users.backup(backups.path()).unwrap();

        users.delete(a.id().unwrap()).unwrap();
        users.compact().unwrap();
        assert!(users.is_empty().unwrap());

        assert!(users.restore(&path).unwrap());
        assert_eq!(users.len().unwrap(), 1);
    }
}
