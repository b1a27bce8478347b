//! File-backed storage engine.
//!
//! One collection persists as three files in its data directory:
//!
//! ```text
//! <dir>/
//! ├─ <name>.json   # snapshot: full live+tombstoned record array
//! ├─ <name>.wal    # newline-delimited pending operations
//! └─ <name>.lock   # single-timestamp writer lock
//! ```
//!
//! Every mutation follows WAL-append -> mutate in memory -> save
//! snapshot -> truncate WAL. A crash between the append and the save
//! leaves the operation in the WAL, where the next `init()` replays it.
//! Snapshot writes are atomic (temp file, rename, directory fsync).

use crate::cache::LruCache;
use crate::engine::{EngineOptions, EngineState, StorageEngine};
use crate::error::{EngineError, EngineResult};
use crate::index::IndexManager;
use crate::lock::LockFile;
use crate::wal::{WalEntry, WalFile};
use jotdb_record::{now, Query, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot document.
#[derive(Debug, Default, Deserialize)]
struct SnapshotDoc {
    #[serde(default)]
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    indexes: Vec<Vec<String>>,
}

/// Borrowed view of the snapshot for serialization.
#[derive(Serialize)]
struct SnapshotDocRef<'a> {
    version: u32,
    records: &'a [Record],
    indexes: &'a [Vec<String>],
}

/// Durable storage engine backed by a JSON snapshot plus a WAL.
#[derive(Debug)]
pub struct FileEngine {
    name: String,
    dir: PathBuf,
    records: Vec<Record>,
    indexes: IndexManager,
    cache: LruCache,
    wal: Option<WalFile>,
    lock: Option<LockFile>,
    state: EngineState,
    failure: Option<String>,
    options: EngineOptions,
}

impl FileEngine {
    /// Creates an engine for the named collection under `dir`.
    ///
    /// No I/O happens until [`StorageEngine::init`].
    #[must_use]
    pub fn new(dir: &Path, name: &str, options: EngineOptions) -> Self {
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            records: Vec::new(),
            indexes: IndexManager::new(),
            cache: LruCache::new(options.cache_capacity),
            wal: None,
            lock: None,
            state: EngineState::Uninitialized,
            failure: None,
            options,
        }
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    /// Returns the WAL file path.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.dir.join(format!("{}.wal", self.name))
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.name))
    }

    fn ensure_ready(&self) -> EngineResult<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Failed => Err(EngineError::Failed {
                message: self.failure.clone().unwrap_or_default(),
            }),
            _ => Err(EngineError::NotInitialized),
        }
    }

    fn try_init(&mut self) -> EngineResult<()> {
        fs::create_dir_all(&self.dir)?;
        let lock = LockFile::acquire(&self.lock_path(), self.options.lock_stale_after)?;

        self.state = EngineState::LoadingSnapshot;
        let doc = self.load_snapshot()?;
        let mut records = doc.records;
        let index_defs = doc.indexes;

        self.state = EngineState::ReplayingWal;
        let mut wal = WalFile::open(&self.wal_path(), self.options.sync_on_write)?;
        let replayed = wal.replay(|entry| {
            apply_entry(&mut records, entry);
            Ok(())
        })?;

        self.records = records;
        self.lock = Some(lock);

        if replayed > 0 {
            debug!(collection = %self.name, replayed, "recovered operations from WAL");
            // The WAL may be dropped only once the snapshot covers it.
            self.save_snapshot_with(&index_defs)?;
        }
        if !wal.is_empty()? {
            // Also clears a discarded torn tail, which would otherwise
            // corrupt the next append.
            wal.truncate()?;
        }
        self.wal = Some(wal);

        self.state = EngineState::RebuildingIndexes;
        self.indexes = IndexManager::new();
        let live: Vec<&Record> = self.records.iter().filter(|r| r.is_live()).collect();
        for def in &index_defs {
            self.indexes.create(def, &live);
        }

        Ok(())
    }

    fn load_snapshot(&self) -> EngineResult<SnapshotDoc> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(SnapshotDoc {
                version: SNAPSHOT_VERSION,
                ..SnapshotDoc::default()
            });
        }
        let contents = fs::read_to_string(&path)?;
        if contents.trim().is_empty() {
            return Ok(SnapshotDoc {
                version: SNAPSHOT_VERSION,
                ..SnapshotDoc::default()
            });
        }
        serde_json::from_str(&contents).map_err(|e| {
            EngineError::corrupted(format!("snapshot {} failed to parse: {e}", path.display()))
        })
    }

    fn save_snapshot(&self) -> EngineResult<()> {
        self.save_snapshot_with(&self.indexes.registered())
    }

    /// Writes the snapshot atomically: temp file, fsync, rename, fsync
    /// the directory.
    fn save_snapshot_with(&self, indexes: &[Vec<String>]) -> EngineResult<()> {
        let doc = SnapshotDocRef {
            version: SNAPSHOT_VERSION,
            records: &self.records,
            indexes,
        };
        let contents = if self.options.pretty_snapshots {
            serde_json::to_string_pretty(&doc)
        } else {
            serde_json::to_string(&doc)
        }
        .map_err(|e| EngineError::corrupted(format!("snapshot encode failed: {e}")))?;

        let path = self.snapshot_path();
        let temp = self.dir.join(format!("{}.json.tmp", self.name));

        let mut file = File::create(&temp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        sync_directory(&self.dir)?;
        Ok(())
    }

    /// Saves the snapshot, then truncates the WAL it now covers.
    fn persist(&mut self) -> EngineResult<()> {
        self.save_snapshot()?;
        if let Some(wal) = self.wal.as_mut() {
            wal.truncate()?;
        }
        Ok(())
    }

    fn wal_mut(&mut self) -> EngineResult<&mut WalFile> {
        self.wal.as_mut().ok_or(EngineError::NotInitialized)
    }

    fn position_of_live(&self, id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.is_live() && r.id() == Some(id))
    }
}

/// Applies one WAL entry to the record set.
///
/// This is the same logic for replay and (conceptually) for runtime
/// mutations. Insert/update are upserts so that replaying an entry the
/// snapshot already covers is a no-op rather than a duplicate.
fn apply_entry(records: &mut Vec<Record>, entry: WalEntry) {
    match entry {
        WalEntry::Insert(record) | WalEntry::Update(record) => {
            match records.iter_mut().find(|r| r.id() == record.id()) {
                Some(slot) => *slot = record,
                None => records.push(record),
            }
        }
        WalEntry::Delete { id, at } => {
            if let Some(record) = records
                .iter_mut()
                .find(|r| r.is_live() && r.id() == Some(id.as_str()))
            {
                record.tombstone(at);
            }
        }
    }
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> EngineResult<()> {
    // On Unix, fsync on a directory makes the rename durable.
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> EngineResult<()> {
    Ok(())
}

impl StorageEngine for FileEngine {
    fn state(&self) -> EngineState {
        self.state
    }

    fn init(&mut self) -> EngineResult<()> {
        if self.state == EngineState::Ready {
            return Ok(());
        }
        match self.try_init() {
            Ok(()) => {
                self.state = EngineState::Ready;
                self.failure = None;
                debug!(collection = %self.name, dir = %self.dir.display(), "engine ready");
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Failed;
                self.failure = Some(e.to_string());
                self.wal = None;
                self.lock = None;
                Err(e)
            }
        }
    }

    fn get(&mut self, id: &str) -> EngineResult<Option<Record>> {
        self.ensure_ready()?;
        if let Some(record) = self.cache.get(id) {
            return Ok(Some(record.clone()));
        }
        let found = self
            .records
            .iter()
            .find(|r| r.is_live() && r.id() == Some(id))
            .cloned();
        if let Some(record) = &found {
            self.cache.set(id.to_string(), record.clone());
        }
        Ok(found)
    }

    fn find(&mut self, query: &Query) -> EngineResult<Vec<Record>> {
        self.ensure_ready()?;
        Ok(self
            .records
            .iter()
            .filter(|r| r.is_live() && query.matches(r))
            .cloned()
            .collect())
    }

    fn insert(&mut self, data: Map<String, Value>) -> EngineResult<Record> {
        self.ensure_ready()?;
        let record = Record::new_insert(data);
        let id = record_id(&record)?;
        let existing = self
            .records
            .iter()
            .position(|r| r.id() == Some(id.as_str()));
        if existing.is_some_and(|pos| self.records[pos].is_live()) {
            return Err(EngineError::already_exists(id));
        }

        self.wal_mut()?.append(&WalEntry::Insert(record.clone()))?;
        match existing {
            // Re-using a tombstoned id replaces the tombstone in place,
            // exactly as WAL replay would.
            Some(pos) => self.records[pos] = record.clone(),
            None => self.records.push(record.clone()),
        }
        self.indexes.note_insert(&record);
        self.persist()?;
        self.cache.set(id.clone(), record.clone());
        debug!(collection = %self.name, id = %id, "inserted record");
        Ok(record)
    }

    fn update(&mut self, id: &str, data: Map<String, Value>) -> EngineResult<Record> {
        self.ensure_ready()?;
        let pos = self
            .position_of_live(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        let old = self.records[pos].clone();
        let merged = old.merged_with(data);

        self.wal_mut()?.append(&WalEntry::Update(merged.clone()))?;
        self.records[pos] = merged.clone();
        self.indexes.note_update(&old, &merged);
        self.persist()?;
        self.cache.set(id.to_string(), merged.clone());
        debug!(collection = %self.name, id, "updated record");
        Ok(merged)
    }

    fn delete(&mut self, id: &str) -> EngineResult<bool> {
        self.ensure_ready()?;
        let pos = self
            .position_of_live(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        let old = self.records[pos].clone();
        let at = now();

        self.wal_mut()?.append(&WalEntry::Delete {
            id: id.to_string(),
            at: at.clone(),
        })?;
        self.records[pos].tombstone(at);
        self.indexes.note_delete(&old);
        self.persist()?;
        self.cache.remove(id);
        debug!(collection = %self.name, id, "deleted record");
        Ok(true)
    }

    fn create_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let live: Vec<&Record> = self.records.iter().filter(|r| r.is_live()).collect();
        if self.indexes.create(fields, &live) {
            self.save_snapshot()?;
        }
        Ok(())
    }

    fn drop_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        if self.indexes.drop_index(fields) {
            self.save_snapshot()?;
        }
        Ok(())
    }

    fn rebuild_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let registered = self.indexes.contains(fields);
        let live: Vec<&Record> = self.records.iter().filter(|r| r.is_live()).collect();
        self.indexes.rebuild(fields, &live);
        if !registered {
            self.save_snapshot()?;
        }
        Ok(())
    }

    fn compact(&mut self) -> EngineResult<bool> {
        self.ensure_ready()?;
        let before = self.records.len();
        self.records.retain(Record::is_live);
        for record in &mut self.records {
            record.strip_tombstone_fields();
        }
        self.persist()?;
        self.cache.clear();
        let live: Vec<&Record> = self.records.iter().collect();
        self.indexes.rebuild_all(&live);
        debug!(
            collection = %self.name,
            purged = before - self.records.len(),
            "compacted collection"
        );
        Ok(true)
    }

    fn backup(&mut self, dir: &Path) -> EngineResult<PathBuf> {
        self.ensure_ready()?;
        fs::create_dir_all(dir)?;
        if !self.snapshot_path().exists() {
            self.save_snapshot()?;
        }

        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%3f");
        let dest = dir.join(format!("{}-{stamp}.json", self.name));
        fs::copy(self.snapshot_path(), &dest)?;

        if let Some(wal) = &self.wal {
            if !wal.is_empty()? {
                let wal_dest = dir.join(format!("{}-{stamp}.wal", self.name));
                fs::copy(wal.path(), &wal_dest)?;
            }
        }

        debug!(collection = %self.name, path = %dest.display(), "wrote backup");
        Ok(dest)
    }

    fn restore(&mut self, path: &Path) -> EngineResult<bool> {
        self.ensure_ready()?;
        let contents = fs::read_to_string(path)?;
        let doc: SnapshotDoc = serde_json::from_str(&contents).map_err(|e| {
            warn!(collection = %self.name, error = %e, "restore failed");
            EngineError::corrupted(format!("backup {} failed to parse: {e}", path.display()))
        })?;

        self.records = doc.records;
        self.persist()?;
        self.cache.clear();
        let live: Vec<&Record> = self.records.iter().filter(|r| r.is_live()).collect();
        self.indexes.rebuild_all(&live);
        debug!(collection = %self.name, path = %path.display(), "restored from backup");
        Ok(true)
    }

    fn len(&self) -> EngineResult<usize> {
        self.ensure_ready()?;
        Ok(self.records.iter().filter(|r| r.is_live()).count())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.wal = None;
        self.lock = None;
        self.cache.clear();
        if self.state == EngineState::Ready {
            debug!(collection = %self.name, "engine closed");
        }
        self.state = EngineState::Uninitialized;
        Ok(())
    }
}

fn record_id(record: &Record) -> EngineResult<String> {
    record
        .id()
        .map(ToString::to_string)
        .ok_or_else(|| EngineError::corrupted("record missing id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn open_engine(dir: &Path) -> FileEngine {
        let mut engine = FileEngine::new(dir, "things", EngineOptions::default());
        engine.init().unwrap();
        engine
    }

    fn query(filter: Value) -> Query {
        match filter {
            Value::Object(map) => Query::parse(&map).unwrap(),
            _ => panic!("filter must be an object"),
        }
    }

    fn snapshot_record_count(engine: &FileEngine) -> usize {
        let contents = fs::read_to_string(engine.snapshot_path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        doc["records"].as_array().unwrap().len()
    }

    #[test]
    fn insert_and_get() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let record = engine.insert(fields(&[("name", json!("alice"))])).unwrap();
        let id = record.id().unwrap().to_string();

        let found = engine.get(&id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("alice")));
        assert!(found.get("_created").is_some());
    }

    #[test]
    fn get_missing_returns_none() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        assert!(engine.get("nope").unwrap().is_none());
    }

    #[test]
    fn ops_fail_before_init() {
        let dir = tempdir().unwrap();
        let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());

        let result = engine.get("x");
        assert!(matches!(result, Err(EngineError::NotInitialized)));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.insert(fields(&[("n", json!(1))])).unwrap();

        engine.init().unwrap();
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let a = engine.insert(fields(&[("n", json!(1))])).unwrap();
        let b = engine.insert(fields(&[("n", json!(1))])).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(engine.len().unwrap(), 2);
    }

    #[test]
    fn explicit_id_is_honored_and_guarded() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let record = engine.insert(fields(&[("id", json!("mine"))])).unwrap();
        assert_eq!(record.id(), Some("mine"));

        let dup = engine.insert(fields(&[("id", json!("mine"))]));
        assert!(matches!(dup, Err(EngineError::AlreadyExists { .. })));
    }

    #[test]
    fn update_merges_shallowly() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let record = engine
            .insert(fields(&[("name", json!("alice")), ("age", json!(30))]))
            .unwrap();
        let id = record.id().unwrap().to_string();

        let merged = engine.update(&id, fields(&[("age", json!(31))])).unwrap();
        assert_eq!(merged.get("age"), Some(&json!(31)));
        assert_eq!(merged.get("name"), Some(&json!("alice")));
        assert_eq!(merged.id(), Some(id.as_str()));
    }

    #[test]
    fn update_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        let result = engine.update("ghost", fields(&[("a", json!(1))]));
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn delete_is_soft_until_compact() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let a = engine.insert(fields(&[("n", json!(1))])).unwrap();
        engine.insert(fields(&[("n", json!(2))])).unwrap();
        let id = a.id().unwrap().to_string();

        assert!(engine.delete(&id).unwrap());

        // Invisible to get/find immediately...
        assert!(engine.get(&id).unwrap().is_none());
        assert_eq!(engine.find(&query(json!({}))).unwrap().len(), 1);
        assert_eq!(engine.len().unwrap(), 1);

        // ...but physically present until compaction.
        assert_eq!(snapshot_record_count(&engine), 2);

        assert!(engine.compact().unwrap());
        assert_eq!(snapshot_record_count(&engine), 1);
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        let result = engine.delete("ghost");
        assert!(matches!(result, Err(EngineError::NotFound { .. })));

        // Deleting twice is NotFound too.
        let a = engine.insert(fields(&[])).unwrap();
        let id = a.id().unwrap().to_string();
        engine.delete(&id).unwrap();
        assert!(matches!(
            engine.delete(&id),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn find_filters_live_records() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        engine
            .insert(fields(&[("age", json!(30)), ("tags", json!(["a", "b"]))]))
            .unwrap();
        engine.insert(fields(&[("age", json!(70))])).unwrap();

        let hits = engine
            .find(&query(json!({
                "age": {"$gte": 18, "$lt": 65},
                "tags": {"$in": ["b", "c"]},
            })))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("age"), Some(&json!(30)));
    }

    #[test]
    fn wal_is_truncated_after_each_persisted_mutation() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        engine.insert(fields(&[("n", json!(1))])).unwrap();
        let wal = WalFile::open(&engine.wal_path(), false).unwrap();
        assert!(wal.is_empty().unwrap());
    }

    #[test]
    fn snapshot_is_pretty_printed() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.insert(fields(&[("n", json!(1))])).unwrap();

        let contents = fs::read_to_string(engine.snapshot_path()).unwrap();
        assert!(contents.contains('\n'));
    }

    #[test]
    fn index_maintained_across_mutations() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        let idx = vec!["city".to_string()];
        engine.create_index(&idx).unwrap();

        let a = engine.insert(fields(&[("city", json!("rome"))])).unwrap();
        let id = a.id().unwrap().to_string();

        assert_eq!(engine.indexes.lookup(&idx, &[json!("rome")]), vec![id.clone()]);

        engine.update(&id, fields(&[("city", json!("oslo"))])).unwrap();
        assert!(engine.indexes.lookup(&idx, &[json!("rome")]).is_empty());
        assert_eq!(engine.indexes.lookup(&idx, &[json!("oslo")]), vec![id.clone()]);

        engine.delete(&id).unwrap();
        assert!(engine.indexes.lookup(&idx, &[json!("oslo")]).is_empty());
    }

    #[test]
    fn malformed_snapshot_fails_init() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("things.json");
        fs::write(&path, "{ not json").unwrap();

        let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
        let result = engine.init();
        assert!(matches!(result, Err(EngineError::Corrupted { .. })));
        assert_eq!(engine.state(), EngineState::Failed);

        // The failure is surfaced on later use, never a half-ready engine.
        assert!(matches!(engine.get("x"), Err(EngineError::Failed { .. })));
    }

    #[test]
    fn lock_blocks_second_writer() {
        let dir = tempdir().unwrap();
        let mut first = open_engine(dir.path());

        let mut second = FileEngine::new(dir.path(), "things", EngineOptions::default());
        assert!(matches!(second.init(), Err(EngineError::Locked { .. })));

        first.close().unwrap();
        second.init().unwrap();
    }
}

/// Tests spanning restarts and simulated crashes.
#[cfg(test)]
mod persistence_tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn records_survive_restart() {
        let dir = tempdir().unwrap();
        let id;
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            let record = engine.insert(fields(&[("n", json!(7))])).unwrap();
            id = record.id().unwrap().to_string();
            engine.close().unwrap();
        }
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            let found = engine.get(&id).unwrap().unwrap();
            assert_eq!(found.get("n"), Some(&json!(7)));
        }
    }

    #[test]
    fn wal_replay_recovers_unsnapshotted_operations() {
        let dir = tempdir().unwrap();
        let (id, stale);
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            let record = engine.insert(fields(&[("n", json!(1))])).unwrap();
            id = record.id().unwrap().to_string();
            stale = record;
            engine.close().unwrap();
        }

        // Simulate a crash after the WAL append but before the snapshot
        // save: the update and a second insert exist only in the WAL.
        {
            let wal_path = dir.path().join("things.wal");
            let mut wal = WalFile::open(&wal_path, false).unwrap();
            let updated = stale.merged_with(fields(&[("n", json!(2))]));
            wal.append(&WalEntry::Update(updated)).unwrap();

            let other = Record::new_insert(fields(&[("id", json!("extra")), ("n", json!(9))]));
            wal.append(&WalEntry::Insert(other)).unwrap();
            wal.append(&WalEntry::Delete {
                id: "extra".to_string(),
                at: jotdb_record::now(),
            })
            .unwrap();
        }

        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();

            let found = engine.get(&id).unwrap().unwrap();
            assert_eq!(found.get("n"), Some(&json!(2)));
            assert!(engine.get("extra").unwrap().is_none());
            assert_eq!(engine.len().unwrap(), 1);

            // Recovery saved a covering snapshot and truncated the WAL.
            let wal = WalFile::open(&engine.wal_path(), false).unwrap();
            assert!(wal.is_empty().unwrap());
        }
    }

    #[test]
    fn replay_is_idempotent_when_snapshot_already_covers_entry() {
        let dir = tempdir().unwrap();
        let id;
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            let record = engine.insert(fields(&[("n", json!(1))])).unwrap();
            id = record.id().unwrap().to_string();

            // Crash between snapshot save and WAL truncation: re-append
            // the already-covered insert.
            let mut wal = WalFile::open(&engine.wal_path(), false).unwrap();
            wal.append(&WalEntry::Insert(record)).unwrap();
            engine.close().unwrap();
        }
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            assert_eq!(engine.len().unwrap(), 1);
            assert!(engine.get(&id).unwrap().is_some());
        }
    }

    #[test]
    fn midlog_wal_corruption_fails_init() {
        let dir = tempdir().unwrap();
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            engine.close().unwrap();
        }

        let wal_path = dir.path().join("things.wal");
        fs::write(
            &wal_path,
            "garbage\n{\"type\":\"delete\",\"data\":{\"id\":\"x\",\"at\":\"t\"}}\n",
        )
        .unwrap();

        let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
        assert!(matches!(engine.init(), Err(EngineError::Corrupted { .. })));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn torn_wal_tail_is_tolerated() {
        let dir = tempdir().unwrap();
        let id;
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            let record = engine.insert(fields(&[("n", json!(1))])).unwrap();
            id = record.id().unwrap().to_string();
            engine.close().unwrap();
        }

        // A half-written final line from a crash mid-append.
        let wal_path = dir.path().join("things.wal");
        fs::write(&wal_path, "{\"type\":\"insert\",\"data\":{\"id\":\"b").unwrap();

        let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
        engine.init().unwrap();
        assert!(engine.get(&id).unwrap().is_some());
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn index_registration_survives_restart() {
        let dir = tempdir().unwrap();
        let idx = vec!["city".to_string()];
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            engine.create_index(&idx).unwrap();
            engine.insert(fields(&[("city", json!("rome"))])).unwrap();
            engine.close().unwrap();
        }
        {
            let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
            engine.init().unwrap();
            assert!(engine.indexes.contains(&idx));
            assert_eq!(engine.indexes.lookup(&idx, &[json!("rome")]).len(), 1);
        }
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
        engine.init().unwrap();

        let a = engine.insert(fields(&[("n", json!(1))])).unwrap();
        let b = engine.insert(fields(&[("n", json!(2))])).unwrap();
        let backup_path = engine.backup(backups.path()).unwrap();
        assert!(backup_path.exists());

        // Empty the collection entirely.
        engine.delete(a.id().unwrap()).unwrap();
        engine.delete(b.id().unwrap()).unwrap();
        engine.compact().unwrap();
        assert_eq!(engine.len().unwrap(), 0);

        assert!(engine.restore(&backup_path).unwrap());
        assert_eq!(engine.len().unwrap(), 2);
        assert!(engine.get(a.id().unwrap()).unwrap().is_some());
        assert!(engine.get(b.id().unwrap()).unwrap().is_some());
    }

    #[test]
    fn compact_strips_tombstone_bookkeeping() {
        let dir = tempdir().unwrap();
        let mut engine = FileEngine::new(dir.path(), "things", EngineOptions::default());
        engine.init().unwrap();

        let keep = engine.insert(fields(&[("n", json!(1))])).unwrap();
        let gone = engine.insert(fields(&[("n", json!(2))])).unwrap();
        engine.delete(gone.id().unwrap()).unwrap();
        engine.compact().unwrap();

        let contents = fs::read_to_string(engine.snapshot_path()).unwrap();
        assert!(!contents.contains("_deleted"));
        assert!(engine.get(keep.id().unwrap()).unwrap().is_some());
    }
}
