//! In-memory storage engine.

use crate::cache::LruCache;
use crate::engine::{EngineOptions, EngineState, StorageEngine};
use crate::error::{EngineError, EngineResult};
use crate::index::IndexManager;
use jotdb_record::{now, Query, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Export/import document format, shared with the file engine's
/// snapshot shape so backups are interchangeable.
#[derive(Debug, Default, Deserialize)]
struct ExportDoc {
    #[serde(default)]
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    records: Vec<Record>,
}

#[derive(Serialize)]
struct ExportDocRef<'a> {
    version: u32,
    records: Vec<&'a Record>,
}

/// Non-persistent storage engine for ephemeral and development
/// workloads.
///
/// Same contract as the durable engines minus the WAL, the lock file,
/// and snapshot persistence: `init()` only flips the state machine, all
/// mutations act directly on an in-process id-to-record map, and
/// `backup`/`restore` serialize to and from a JSON file purely as an
/// export/import convenience - no crash durability is implied.
#[derive(Debug)]
pub struct MemoryEngine {
    name: String,
    records: HashMap<String, Record>,
    indexes: IndexManager,
    cache: LruCache,
    state: EngineState,
}

impl MemoryEngine {
    /// Creates an engine for the named collection.
    #[must_use]
    pub fn new(name: &str, options: EngineOptions) -> Self {
        Self {
            name: name.to_string(),
            records: HashMap::new(),
            indexes: IndexManager::new(),
            cache: LruCache::new(options.cache_capacity),
            state: EngineState::Uninitialized,
        }
    }

    fn ensure_ready(&self) -> EngineResult<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            _ => Err(EngineError::NotInitialized),
        }
    }

    fn live(&self, id: &str) -> Option<&Record> {
        self.records.get(id).filter(|r| r.is_live())
    }

    fn live_refs(&self) -> Vec<&Record> {
        self.records.values().filter(|r| r.is_live()).collect()
    }
}

impl StorageEngine for MemoryEngine {
    fn state(&self) -> EngineState {
        self.state
    }

    fn init(&mut self) -> EngineResult<()> {
        // Nothing to load or replay.
        self.state = EngineState::Ready;
        Ok(())
    }

    fn get(&mut self, id: &str) -> EngineResult<Option<Record>> {
        self.ensure_ready()?;
        if let Some(record) = self.cache.get(id) {
            return Ok(Some(record.clone()));
        }
        let found = self.live(id).cloned();
        if let Some(record) = &found {
            self.cache.set(id.to_string(), record.clone());
        }
        Ok(found)
    }

    fn find(&mut self, query: &Query) -> EngineResult<Vec<Record>> {
        self.ensure_ready()?;
        Ok(self
            .records
            .values()
            .filter(|r| r.is_live() && query.matches(r))
            .cloned()
            .collect())
    }

    fn insert(&mut self, data: Map<String, Value>) -> EngineResult<Record> {
        self.ensure_ready()?;
        let record = Record::new_insert(data);
        let id = record
            .id()
            .map(ToString::to_string)
            .ok_or_else(|| EngineError::corrupted("record missing id"))?;
        if self.live(&id).is_some() {
            return Err(EngineError::already_exists(id));
        }

        self.records.insert(id.clone(), record.clone());
        self.indexes.note_insert(&record);
        self.cache.set(id, record.clone());
        Ok(record)
    }

    fn update(&mut self, id: &str, data: Map<String, Value>) -> EngineResult<Record> {
        self.ensure_ready()?;
        let old = self
            .live(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))?;
        let merged = old.merged_with(data);

        self.records.insert(id.to_string(), merged.clone());
        self.indexes.note_update(&old, &merged);
        self.cache.set(id.to_string(), merged.clone());
        Ok(merged)
    }

    fn delete(&mut self, id: &str) -> EngineResult<bool> {
        self.ensure_ready()?;
        let old = self
            .live(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))?;

        if let Some(record) = self.records.get_mut(id) {
            record.tombstone(now());
        }
        self.indexes.note_delete(&old);
        self.cache.remove(id);
        Ok(true)
    }

    fn create_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let live: Vec<&Record> = self.records.values().filter(|r| r.is_live()).collect();
        self.indexes.create(fields, &live);
        Ok(())
    }

    fn drop_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        self.indexes.drop_index(fields);
        Ok(())
    }

    fn rebuild_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let live: Vec<&Record> = self.records.values().filter(|r| r.is_live()).collect();
        self.indexes.rebuild(fields, &live);
        Ok(())
    }

    fn compact(&mut self) -> EngineResult<bool> {
        self.ensure_ready()?;
        self.records.retain(|_, r| r.is_live());
        for record in self.records.values_mut() {
            record.strip_tombstone_fields();
        }
        self.cache.clear();
        let live: Vec<&Record> = self.records.values().collect();
        self.indexes.rebuild_all(&live);
        Ok(true)
    }

    fn backup(&mut self, dir: &Path) -> EngineResult<PathBuf> {
        self.ensure_ready()?;
        fs::create_dir_all(dir)?;

        let doc = ExportDocRef {
            version: 1,
            records: self.records.values().collect(),
        };
        let contents = serde_json::to_string_pretty(&doc)
            .map_err(|e| EngineError::corrupted(format!("export encode failed: {e}")))?;

        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%3f");
        let dest = dir.join(format!("{}-{stamp}.json", self.name));
        fs::write(&dest, contents)?;
        debug!(collection = %self.name, path = %dest.display(), "wrote export");
        Ok(dest)
    }

    fn restore(&mut self, path: &Path) -> EngineResult<bool> {
        self.ensure_ready()?;
        let contents = fs::read_to_string(path)?;
        let doc: ExportDoc = serde_json::from_str(&contents).map_err(|e| {
            EngineError::corrupted(format!("import {} failed to parse: {e}", path.display()))
        })?;

        let mut records = HashMap::with_capacity(doc.records.len());
        for record in doc.records {
            let id = record
                .id()
                .map(ToString::to_string)
                .ok_or_else(|| EngineError::corrupted("imported record missing id"))?;
            records.insert(id, record);
        }

        self.records = records;
        self.cache.clear();
        let live: Vec<&Record> = self.records.values().filter(|r| r.is_live()).collect();
        self.indexes.rebuild_all(&live);
        Ok(true)
    }

    fn len(&self) -> EngineResult<usize> {
        self.ensure_ready()?;
        Ok(self.records.values().filter(|r| r.is_live()).count())
    }

    fn close(&mut self) -> EngineResult<()> {
        // No handles to finalize; the data outlives the close so a
        // re-init resumes where it left off.
        self.cache.clear();
        self.state = EngineState::Uninitialized;
        Ok(())
    }
}
